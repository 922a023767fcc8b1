use std::path::PathBuf;

use crate::source::SearchSettings;
use crate::sync::SyncConfig;

/// Largest page size the search API accepts.
const MAX_PER_PAGE: u32 = 500;

/// Application configuration resolved from the command line.
pub struct Config {
    pub data_dir: PathBuf,
    pub api_key: Option<String>,
    pub concurrency: u16,
    pub max_page: u32,
    pub per_page: u32,
    pub radius_km: u32,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("concurrency", &self.concurrency)
            .field("max_page", &self.max_page)
            .field("per_page", &self.per_page)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: &crate::cli::Cli) -> anyhow::Result<Self> {
        if cli.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if cli.max_page == 0 {
            anyhow::bail!("--max-page must be at least 1");
        }
        if cli.per_page == 0 || cli.per_page > MAX_PER_PAGE {
            anyhow::bail!("--per-page must be between 1 and {}", MAX_PER_PAGE);
        }
        if cli.radius == 0 || cli.radius > 32 {
            anyhow::bail!("--radius must be between 1 and 32 km");
        }

        Ok(Self {
            data_dir: expand_tilde(&cli.data_dir),
            api_key: cli.api_key.clone().filter(|k| !k.trim().is_empty()),
            concurrency: cli.concurrency,
            max_page: cli.max_page,
            per_page: cli.per_page,
            radius_km: cli.radius,
            no_progress_bar: cli.no_progress_bar,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("album.db")
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            concurrent_downloads: self.concurrency as usize,
            max_page: self.max_page,
            lock_dir: Some(self.data_dir.join("locks")),
        }
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            radius_km: self.radius_km,
            per_page: self.per_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> crate::cli::Cli {
        let mut full = vec!["pin-album"];
        full.extend_from_slice(args);
        full.push("status");
        crate::cli::Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_db_path_inside_data_dir() {
        let cfg = Config::from_cli(&parse(&["--data-dir", "/tmp/pins"])).unwrap();
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/pins/album.db"));
    }

    #[test]
    fn test_sync_and_search_settings_passthrough() {
        let cfg = Config::from_cli(&parse(&[
            "--concurrency",
            "6",
            "--max-page",
            "4",
            "--per-page",
            "50",
            "--radius",
            "5",
        ]))
        .unwrap();
        let sync = cfg.sync_config();
        assert_eq!(sync.concurrent_downloads, 6);
        assert_eq!(sync.max_page, 4);
        assert_eq!(sync.lock_dir, Some(cfg.data_dir.join("locks")));
        let search = cfg.search_settings();
        assert_eq!(search.per_page, 50);
        assert_eq!(search.radius_km, 5);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(Config::from_cli(&parse(&["--concurrency", "0"])).is_err());
    }

    #[test]
    fn test_rejects_oversized_page() {
        assert!(Config::from_cli(&parse(&["--per-page", "501"])).is_err());
    }

    #[test]
    fn test_blank_api_key_treated_as_missing() {
        let cfg = Config::from_cli(&parse(&["--api-key", "  "])).unwrap();
        assert!(cfg.api_key.is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let cfg = Config::from_cli(&parse(&["--api-key", "secret-key"])).unwrap();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("secret-key"));
    }
}
