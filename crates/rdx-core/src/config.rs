use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use rdx_domain::DEFAULT_QUANTUM_SECS;

pub const ROOT_ENV: &str = "RDX_ROOT";
const STORE_RETRIES_ENV: &str = "RDX_STORE_RETRIES";
const RETRY_DELAY_ENV: &str = "RDX_RETRY_DELAY_MS";
const LIST_PAGE_SIZE_ENV: &str = "RDX_LIST_PAGE_SIZE";
const CONCURRENCY_ENV: &str = "RDX_CONCURRENCY";
const PAGE_SIZE_ENV: &str = "RDX_PAGE_SIZE";
const QUANTUM_ENV: &str = "RDX_CHUNK_QUANTUM";
const KEY_BITS_ENV: &str = "RDX_KEY_BITS";

#[derive(Clone, Debug, Default)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.var(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|err| anyhow!("invalid {key}={raw}: {err}")),
            None => Ok(default),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    root: PathBuf,
    store: StoreConfig,
    chunking: ChunkingConfig,
    keys: KeyConfig,
}

impl Config {
    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error if the data root cannot be resolved or a numeric
    /// variable does not parse.
    pub fn from_env(root_override: Option<&Path>) -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture(), root_override)
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot, root_override: Option<&Path>) -> Result<Self> {
        let root = match (root_override, snapshot.var(ROOT_ENV)) {
            (Some(root), _) => root.to_path_buf(),
            (None, Some(root)) => PathBuf::from(root),
            (None, None) => dirs_next::home_dir()
                .map(|home| home.join(".rdx"))
                .context("unable to determine home directory for the rdx data root")?,
        };

        let store = StoreConfig {
            retries: snapshot.parsed(STORE_RETRIES_ENV, 1)?,
            retry_delay: Duration::from_millis(snapshot.parsed(RETRY_DELAY_ENV, 200)?),
            list_page_size: positive(LIST_PAGE_SIZE_ENV, snapshot.parsed(LIST_PAGE_SIZE_ENV, 1000)?)?,
        };
        let chunking = ChunkingConfig {
            concurrency: positive(CONCURRENCY_ENV, snapshot.parsed(CONCURRENCY_ENV, 10)?)?,
            page_size: positive(PAGE_SIZE_ENV, snapshot.parsed(PAGE_SIZE_ENV, 250)?)?,
            quantum_secs: snapshot.parsed(QUANTUM_ENV, DEFAULT_QUANTUM_SECS)?,
        };
        if chunking.quantum_secs <= 0 {
            bail!("{QUANTUM_ENV} must be positive (got {})", chunking.quantum_secs);
        }
        let keys = KeyConfig {
            rsa_bits: snapshot.parsed(KEY_BITS_ENV, 2048)?,
        };
        if keys.rsa_bits < 1024 {
            bail!("{KEY_BITS_ENV} must be at least 1024 (got {})", keys.rsa_bits);
        }

        Ok(Self {
            root,
            store,
            chunking,
            keys,
        })
    }

    /// Defaults rooted at `root`, ignoring the environment.
    #[must_use]
    pub fn for_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            store: StoreConfig {
                retries: 1,
                retry_delay: Duration::from_millis(200),
                list_page_size: 1000,
            },
            chunking: ChunkingConfig {
                concurrency: 10,
                page_size: 250,
                quantum_secs: DEFAULT_QUANTUM_SECS,
            },
            keys: KeyConfig { rsa_bits: 2048 },
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    #[must_use]
    pub fn chunking(&self) -> &ChunkingConfig {
        &self.chunking
    }

    #[must_use]
    pub fn keys(&self) -> &KeyConfig {
        &self.keys
    }

    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    #[must_use]
    pub fn with_keys(mut self, keys: KeyConfig) -> Self {
        self.keys = keys;
        self
    }
}

fn positive(key: &str, value: usize) -> Result<usize> {
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(value)
}

#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub retry_delay: Duration,
    pub list_page_size: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkingConfig {
    pub concurrency: usize,
    pub page_size: usize,
    pub quantum_secs: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct KeyConfig {
    pub rsa_bits: usize,
}
