use crate::collect::CollectOptions;
use crate::report;
use crate::GatherError;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_RANK: &str = "RANK";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_STORE_DIR: &str = "DETGATHER_STORE_DIR";
pub const ENV_BARRIER_TIMEOUT_SECS: &str = "DETGATHER_BARRIER_TIMEOUT_SECS";
pub const ENV_TMPDIR: &str = "DETGATHER_TMPDIR";

/// How the job's worker processes are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Launcher {
    /// One process, no collection step.
    None,
    /// Separate processes; rank and world size come from the environment.
    Env,
    /// Worker threads inside this process.
    Local,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub launcher: Launcher,
    pub rank: usize,
    pub world_size: usize,
    pub store_dir: Option<PathBuf>,
    pub tmpdir: Option<PathBuf>,
    pub barrier_timeout: Option<Duration>,
    pub padded: bool,
    pub out: Option<PathBuf>,
}

impl JobConfig {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            rank: 0,
            world_size: 1,
            store_dir: None,
            tmpdir: None,
            barrier_timeout: None,
            padded: false,
            out: None,
        }
    }

    /// Fill rank, world size and unset paths from the environment.
    pub fn with_env(mut self) -> Result<Self, GatherError> {
        self.apply_env(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), GatherError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.launcher == Launcher::Env {
            self.rank = parse_required(&lookup, ENV_RANK)?;
            self.world_size = parse_required(&lookup, ENV_WORLD_SIZE)?;
            if self.store_dir.is_none() {
                self.store_dir = lookup(ENV_STORE_DIR).filter(|s| !s.is_empty()).map(PathBuf::from);
            }
        }
        if self.tmpdir.is_none() {
            self.tmpdir = lookup(ENV_TMPDIR).filter(|s| !s.is_empty()).map(PathBuf::from);
        }
        if self.barrier_timeout.is_none() {
            if let Some(raw) = lookup(ENV_BARRIER_TIMEOUT_SECS).filter(|s| !s.is_empty()) {
                let secs: u64 = raw.trim().parse().map_err(|e| {
                    GatherError::Config(format!("{}={:?}: {}", ENV_BARRIER_TIMEOUT_SECS, raw, e))
                })?;
                self.barrier_timeout = Some(Duration::from_secs(secs));
            }
        }
        Ok(())
    }

    /// Checks that must pass before any worker starts.
    pub fn validate(&self) -> Result<(), GatherError> {
        if self.world_size == 0 {
            return Err(GatherError::Config("world size must be at least 1".to_string()));
        }
        if self.rank >= self.world_size {
            return Err(GatherError::Config(format!(
                "rank {} is out of range for world size {}",
                self.rank, self.world_size
            )));
        }
        if self.launcher == Launcher::Env && self.store_dir.is_none() {
            return Err(GatherError::Config(format!(
                "the env launcher needs a shared store directory ({} or --store-dir)",
                ENV_STORE_DIR
            )));
        }
        if self.launcher == Launcher::None && self.world_size != 1 {
            return Err(GatherError::Config(
                "the none launcher runs exactly one worker".to_string(),
            ));
        }
        if let Some(out) = &self.out {
            report::validate_output_path(out)?;
        }
        Ok(())
    }

    /// Negotiated directories go under the shared store so every process can
    /// reach them.
    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            tmpdir: self.tmpdir.clone(),
            temp_root: match self.launcher {
                Launcher::Env => self.store_dir.as_ref().map(|dir| dir.join("rendezvous")),
                _ => None,
            },
        }
    }
}

fn parse_required<F>(lookup: &F, key: &str) -> Result<usize, GatherError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)
        .ok_or_else(|| GatherError::Config(format!("{} is not set", key)))?;
    raw.trim()
        .parse()
        .map_err(|e| GatherError::Config(format!("{}={:?}: {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_launcher_reads_rank_and_world_size() {
        let mut config = JobConfig::new(Launcher::Env);
        config
            .apply_env(env(&[
                ("RANK", "2"),
                ("WORLD_SIZE", "4"),
                ("DETGATHER_STORE_DIR", "/shared/job1"),
                ("DETGATHER_BARRIER_TIMEOUT_SECS", "30"),
            ]))
            .unwrap();
        assert_eq!(config.rank, 2);
        assert_eq!(config.world_size, 4);
        assert_eq!(config.store_dir, Some(PathBuf::from("/shared/job1")));
        assert_eq!(config.barrier_timeout, Some(Duration::from_secs(30)));
        config.validate().unwrap();
        assert_eq!(
            config.collect_options().temp_root,
            Some(PathBuf::from("/shared/job1/rendezvous"))
        );
    }

    #[test]
    fn test_env_launcher_requires_rank() {
        let mut config = JobConfig::new(Launcher::Env);
        let result = config.apply_env(env(&[("WORLD_SIZE", "4")]));
        assert!(matches!(result, Err(GatherError::Config(_))));
    }

    #[test]
    fn test_bad_timeout_is_config_error() {
        let mut config = JobConfig::new(Launcher::None);
        let result = config.apply_env(env(&[("DETGATHER_BARRIER_TIMEOUT_SECS", "soon")]));
        assert!(matches!(result, Err(GatherError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_output_and_rank() {
        let mut config = JobConfig::new(Launcher::None);
        config.out = Some(PathBuf::from("results.pkl"));
        assert!(config.validate().is_err());

        let mut config = JobConfig::new(Launcher::Local);
        config.world_size = 2;
        config.rank = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_tmpdir_wins_over_env() {
        let mut config = JobConfig::new(Launcher::Local);
        config.tmpdir = Some(PathBuf::from("/explicit"));
        config.apply_env(env(&[("DETGATHER_TMPDIR", "/from_env")])).unwrap();
        assert_eq!(config.collect_options().tmpdir, Some(PathBuf::from("/explicit")));
    }
}
