use crate::core::job::JobSpec;
use anyhow::{bail, Context, Result};
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use range_parser::parse;
use serde::Deserialize;
use std::path::Path;

/// Parse GPU indices from string inputs, supporting ranges like "0-2" or comma-separated "0,1,2".
///
/// # Examples
///
/// ```
/// use expflow::utils::parse_gpu_indices;
///
/// assert_eq!(parse_gpu_indices("0").unwrap(), vec![0]);
/// assert_eq!(parse_gpu_indices("0,2,4").unwrap(), vec![0, 2, 4]);
/// assert_eq!(parse_gpu_indices("0-2").unwrap(), vec![0, 1, 2]);
/// assert_eq!(parse_gpu_indices("0-1,3").unwrap(), vec![0, 1, 3]);
/// ```
pub fn parse_gpu_indices(gpu_string: &str) -> Result<Vec<u32>> {
    let mut parsed: Vec<u32> = parse::<u32>(gpu_string.trim())
        .context(format!("Invalid GPU index or range: {}", gpu_string))?;

    parsed.sort_unstable();
    parsed.dedup();

    Ok(parsed)
}

#[derive(Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// Reads job specs from a TOML file (`[[jobs]]` tables) or a JSON array.
pub fn read_jobs_file(path: &Path) -> Result<Vec<JobSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read jobs file {}", path.display()))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => {
            let file: JobsFile = toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?;
            Ok(file.jobs)
        }
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display())),
        _ => bail!(
            "Unsupported jobs file {}: expected a .toml or .json extension",
            path.display()
        ),
    }
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::ParamValue;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_gpu_indices_mixed() {
        assert_eq!(parse_gpu_indices("0-1,3").unwrap(), vec![0, 1, 3]);
        assert_eq!(parse_gpu_indices("0,2-4,7").unwrap(), vec![0, 2, 3, 4, 7]);
        // Test unsorted input gets sorted
        assert_eq!(parse_gpu_indices("3,1,2").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_gpu_indices_duplicates() {
        assert_eq!(parse_gpu_indices("0,0,1,1").unwrap(), vec![0, 1]);
        assert_eq!(parse_gpu_indices("0-2,1-3").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_gpu_indices_invalid() {
        assert!(parse_gpu_indices("").is_err());
        assert!(parse_gpu_indices("abc").is_err());
        assert!(parse_gpu_indices("-1").is_err());
    }

    #[test]
    fn test_read_toml_jobs() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(
            b"[[jobs]]\nnumber = 10\nlr = 0.5\n\n[[jobs]]\nnumber = 20\nmul = [1, 2]\n_result_subdir = 'b'\n",
        )
        .unwrap();
        let jobs = read_jobs_file(file.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].get("lr"), Some(&ParamValue::Float(0.5)));
        assert_eq!(jobs[1].get("mul"), Some(&ParamValue::from(vec![1, 2])));
        assert_eq!(jobs[1].result_subdir(), Some("b"));
    }

    #[test]
    fn test_read_json_jobs() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(br#"[{"number": 1, "gpu": 0}, {"number": 2, "dry": null}]"#)
            .unwrap();
        let jobs = read_jobs_file(file.path()).unwrap();
        assert_eq!(jobs[0].gpu(), Some(0));
        assert_eq!(jobs[1].get("dry"), Some(&ParamValue::Flag));
    }

    #[test]
    fn test_read_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(read_jobs_file(file.path()).is_err());
    }
}
