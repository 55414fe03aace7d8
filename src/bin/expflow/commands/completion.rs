use crate::cli::ExpFlow;
use clap::CommandFactory;
use clap_complete::{generate, Shell};

pub fn handle_completion(shell: Shell) {
    let mut cmd = ExpFlow::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
