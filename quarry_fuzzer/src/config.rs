use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;

/// How samples reach the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    File,
    Shmem,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(DeliveryMode::File),
            "shmem" => Ok(DeliveryMode::Shmem),
            other => Err(format!("unknown sample delivery option: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Input corpus directory; `None` means the session is restored from
    /// a previous snapshot instead.
    pub input: Option<PathBuf>,
    pub output: PathBuf,
    pub jobs: usize,
    pub timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub corpus_timeout_ms: u64,
    pub server_addr: Option<String>,
    pub resume: bool,
    pub delivery: DeliveryMode,
    pub save_hangs: bool,
    /// Target command line; `@@` is replaced per worker with the input
    /// path or shared memory name.
    pub target_command: Vec<String>,

    pub server_update_interval_ms: u64,
    pub acceptable_hang_ratio: f64,
    pub acceptable_crash_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: None,
            output: PathBuf::from("output"),
            jobs: 1,
            timeout_ms: i32::MAX as u64,
            init_timeout_ms: i32::MAX as u64,
            corpus_timeout_ms: i32::MAX as u64,
            server_addr: None,
            resume: false,
            delivery: DeliveryMode::File,
            save_hangs: false,
            target_command: Vec::new(),
            server_update_interval_ms: 5 * 60 * 1000,
            acceptable_hang_ratio: 0.01,
            acceptable_crash_ratio: 0.02,
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.input.is_none() && !self.resume {
            anyhow::bail!("either an input directory or --resume is required");
        }
        if let Some(input) = self.input.as_ref() {
            if !input.is_dir() {
                anyhow::bail!("bad input dir: {}", input.display());
            }
        }
        if self.output.exists() && !self.output.is_dir() {
            anyhow::bail!("'{}' is not a directory", self.output.display());
        }
        if self.jobs == 0 {
            anyhow::bail!("at least one worker is required");
        }
        if self.target_command.is_empty() {
            anyhow::bail!("no target command (pass it after --)");
        }
        Ok(())
    }

    pub fn setup_directories(&self) -> anyhow::Result<()> {
        for dir in [
            self.output.clone(),
            self.crash_dir(),
            self.hangs_dir(),
            self.sample_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.output.join("crashes")
    }

    pub fn hangs_dir(&self) -> PathBuf {
        self.output.join("hangs")
    }

    pub fn sample_dir(&self) -> PathBuf {
        self.output.join("samples")
    }

    pub fn state_file(&self) -> PathBuf {
        self.output.join("state.dat")
    }

    pub fn sample_path(&self, index: u64) -> PathBuf {
        self.sample_dir().join(format!("sample_{:05}", index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_parsing() {
        assert_eq!(DeliveryMode::from_str("file").unwrap(), DeliveryMode::File);
        assert_eq!(
            DeliveryMode::from_str("shmem").unwrap(),
            DeliveryMode::Shmem
        );
        assert!(DeliveryMode::from_str("pigeon").is_err());
    }

    #[test]
    fn check_rejects_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            input: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn check_requires_input_or_resume() {
        let config = Config {
            target_command: vec!["./target".to_string(), "@@".to_string()],
            ..Config::default()
        };
        assert!(config.check().is_err());

        let resumed = Config {
            resume: true,
            ..config
        };
        assert!(resumed.check().is_ok());
    }
}
