#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

pub use self::listener::Listener;
pub use self::logging::Log;
pub use self::options::Options;

pub mod listener;
pub mod logging;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Layers, lowest priority first: system file, local file, `--config` file,
    /// `MQBROKER_*` environment, then the bind flags on the command line.
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqbroker/mqbroker").required(false))
            .add_source(File::with_name("mqbroker").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("mqbroker").prefix_separator("_").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(addr) = opts.bind_addr {
            inner.listener.addr = addr;
        }
        if let Some(port) = opts.bind_port {
            inner.listener.port = port;
        }
        if inner.listener.keepalive_backoff <= 0.5 {
            return Err(anyhow!(
                "listener.keepalive_backoff must be greater than 0.5, got {}",
                inner.listener.keepalive_backoff
            ));
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("listener address is {}", cfg.listener.laddr());
        log::info!(
            "max_inflight is {}, max_mqueue_len is {}, message_retry_interval is {:?}, max_message_retries is {}",
            cfg.listener.max_inflight,
            cfg.listener.max_mqueue_len,
            cfg.listener.message_retry_interval,
            cfg.listener.max_message_retries
        );
        if let Some(cfg_name) = cfg.opts.cfg_name.as_ref() {
            log::info!("config file is {}", cfg_name);
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Mqtt {
    /// 0 means unlimited
    #[serde(default)]
    pub max_sessions: usize,
}
