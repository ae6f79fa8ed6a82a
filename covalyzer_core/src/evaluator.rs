use crate::config::ToolchainSettings;
use crate::replay::PROFILE_EXTENSION;
use log::info;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

pub const MERGED_PROFILE_FILENAME: &str = "merged.profdata";
pub const SUMMARY_FILENAME: &str = "coverage_summary.txt";
pub const SHOW_FILENAME: &str = "coverage_show.txt";

#[derive(Error, Debug)]
pub enum EvaluatorError {
    #[error("No .{PROFILE_EXTENSION} files found in {0:?}")]
    NoProfiles(PathBuf),

    #[error("Failed to run {tool:?}: {source}")]
    Spawn {
        tool: PathBuf,
        source: std::io::Error,
    },

    #[error("{tool:?} failed ({status}): {stderr}")]
    ToolFailed {
        tool: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("Coverage evaluator I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Files produced by a completed evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub profiles_merged: usize,
    pub merged_profile: PathBuf,
    pub summary_path: PathBuf,
    pub summary: String,
    pub show_path: Option<PathBuf>,
}

/// Merges raw profiles and renders coverage reports with the LLVM toolchain.
#[derive(Debug, Clone)]
pub struct CoverageEvaluator {
    profile_dir: PathBuf,
    coverage_binary: PathBuf,
    output_dir: PathBuf,
    toolchain: ToolchainSettings,
}

impl CoverageEvaluator {
    pub fn new(
        profile_dir: PathBuf,
        coverage_binary: PathBuf,
        output_dir: PathBuf,
        toolchain: ToolchainSettings,
    ) -> Self {
        Self {
            profile_dir,
            coverage_binary,
            output_dir,
            toolchain,
        }
    }

    /// All raw profiles in the profile directory, sorted by path.
    pub fn collect_profiles(&self) -> Result<Vec<PathBuf>, EvaluatorError> {
        let entries = match fs::read_dir(&self.profile_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(EvaluatorError::Io {
                    path: self.profile_dir.clone(),
                    source,
                });
            }
        };
        let mut profiles = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| EvaluatorError::Io {
                    path: self.profile_dir.clone(),
                    source,
                })?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == PROFILE_EXTENSION) {
                profiles.push(path);
            }
        }
        profiles.sort();
        Ok(profiles)
    }

    /// `llvm-profdata merge -sparse -o <out>/merged.profdata <profiles…>`
    pub fn merge_profiles(&self) -> Result<(PathBuf, usize), EvaluatorError> {
        let profiles = self.collect_profiles()?;
        if profiles.is_empty() {
            return Err(EvaluatorError::NoProfiles(self.profile_dir.clone()));
        }
        fs::create_dir_all(&self.output_dir).map_err(|source| EvaluatorError::Io {
            path: self.output_dir.clone(),
            source,
        })?;

        let merged = self.output_dir.join(MERGED_PROFILE_FILENAME);
        let mut args: Vec<OsString> = vec![
            "merge".into(),
            "-sparse".into(),
            "-o".into(),
            merged.clone().into_os_string(),
        ];
        args.extend(profiles.iter().map(|p| p.clone().into_os_string()));

        run_tool(&self.toolchain.profdata, &args, Stdio::null())?;
        Ok((merged, profiles.len()))
    }

    /// `llvm-cov report <binary> -instr-profile=<merged>`, returned as text.
    pub fn generate_report(&self, merged: &Path) -> Result<String, EvaluatorError> {
        let stdout = run_tool(
            &self.toolchain.cov,
            &self.cov_args("report", merged),
            Stdio::piped(),
        )?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// `llvm-cov show <binary> -instr-profile=<merged>` written straight to `dest`.
    pub fn show_report(&self, merged: &Path, dest: &Path) -> Result<(), EvaluatorError> {
        let file = File::create(dest).map_err(|source| EvaluatorError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        run_tool(
            &self.toolchain.cov,
            &self.cov_args("show", merged),
            Stdio::from(file),
        )?;
        Ok(())
    }

    pub fn evaluate(&self) -> Result<Evaluation, EvaluatorError> {
        info!("Merging coverage profiles...");
        let (merged_profile, profiles_merged) = self.merge_profiles()?;

        info!("Generating coverage report...");
        let summary = self.generate_report(&merged_profile)?;
        let summary_path = self.output_dir.join(SUMMARY_FILENAME);
        fs::write(&summary_path, &summary).map_err(|source| EvaluatorError::Io {
            path: summary_path.clone(),
            source,
        })?;

        let show_path = if self.toolchain.show_report {
            let path = self.output_dir.join(SHOW_FILENAME);
            self.show_report(&merged_profile, &path)?;
            Some(path)
        } else {
            None
        };

        info!("Merged {profiles_merged} profiles into {merged_profile:?}");
        Ok(Evaluation {
            profiles_merged,
            merged_profile,
            summary_path,
            summary,
            show_path,
        })
    }

    fn cov_args(&self, subcommand: &str, merged: &Path) -> Vec<OsString> {
        let mut instr_profile = OsString::from("-instr-profile=");
        instr_profile.push(merged);
        vec![
            subcommand.into(),
            self.coverage_binary.clone().into_os_string(),
            instr_profile,
        ]
    }
}

/// Runs a toolchain executable to completion and returns its stdout (empty unless piped).
fn run_tool(tool: &Path, args: &[OsString], stdout: Stdio) -> Result<Vec<u8>, EvaluatorError> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| EvaluatorError::Spawn {
            tool: tool.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(EvaluatorError::ToolFailed {
            tool: tool.to_path_buf(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn evaluator_in(dir: &Path, toolchain: ToolchainSettings) -> CoverageEvaluator {
        CoverageEvaluator::new(
            dir.to_path_buf(),
            PathBuf::from("./target_cov"),
            dir.to_path_buf(),
            toolchain,
        )
    }

    #[test]
    fn collects_only_raw_profiles_sorted() {
        let dir = tempdir().unwrap();
        for name in ["segment_1.profraw", "batch_0.profraw", "merged.profdata", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let evaluator = evaluator_in(dir.path(), ToolchainSettings::default());
        let names: Vec<_> = evaluator
            .collect_profiles()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["batch_0.profraw", "segment_1.profraw"]);
    }

    #[test]
    fn merge_without_profiles_is_an_error() {
        let dir = tempdir().unwrap();
        let evaluator = evaluator_in(dir.path(), ToolchainSettings::default());
        assert!(matches!(
            evaluator.merge_profiles(),
            Err(EvaluatorError::NoProfiles(_))
        ));

        let missing = evaluator_in(&dir.path().join("absent"), ToolchainSettings::default());
        assert!(missing.collect_profiles().unwrap().is_empty());
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("batch_0.profraw"), b"x").unwrap();
        let evaluator = evaluator_in(
            dir.path(),
            ToolchainSettings {
                profdata: PathBuf::from("./no_such_llvm_profdata_12345"),
                ..ToolchainSettings::default()
            },
        );
        assert!(matches!(
            evaluator.merge_profiles(),
            Err(EvaluatorError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    mod with_fake_toolchain {
        use super::*;

        fn fake_toolchain(show_report: bool) -> ToolchainSettings {
            let targets = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../test_targets");
            ToolchainSettings {
                profdata: targets.join("fake_llvm_profdata.sh"),
                cov: targets.join("fake_llvm_cov.sh"),
                show_report,
            }
        }

        #[test]
        fn evaluate_merges_every_profile_and_writes_reports() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("batch_0.profraw"), b"first;").unwrap();
            fs::write(dir.path().join("batch_1000.profraw"), b"second;").unwrap();
            let evaluator = evaluator_in(dir.path(), fake_toolchain(true));

            let evaluation = evaluator.evaluate().unwrap();
            assert_eq!(evaluation.profiles_merged, 2);
            assert_eq!(
                fs::read_to_string(&evaluation.merged_profile).unwrap(),
                "first;second;"
            );
            assert!(evaluation.summary.contains("TOTAL"));
            assert_eq!(
                fs::read_to_string(&evaluation.summary_path).unwrap(),
                evaluation.summary
            );
            let show = fs::read_to_string(evaluation.show_path.unwrap()).unwrap();
            assert!(show.starts_with("./target_cov"));
        }

        #[test]
        fn failing_tool_reports_stderr() {
            let dir = tempdir().unwrap();
            let evaluator = evaluator_in(dir.path(), fake_toolchain(false));
            let err = evaluator
                .generate_report(&dir.path().join("missing.profdata"))
                .unwrap_err();
            match err {
                EvaluatorError::ToolFailed { stderr, .. } => assert!(stderr.contains("missing")),
                other => panic!("Expected ToolFailed, got {other:?}"),
            }
        }
    }
}
