use crate::config::GatewayConfig;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

pub const LOG_FILE_NAME: &str = "coldchain-gateway.log";

/// Where formatted log lines go: always stdout, plus the gateway log file
/// when a log directory is configured.
#[derive(Clone, Default)]
pub struct LogSink {
    path: Option<PathBuf>,
    file: Option<Arc<Mutex<File>>>,
}

impl LogSink {
    pub fn stdout_only() -> Self {
        Self::default()
    }

    /// Opens `<log_dir>/coldchain-gateway.log` for append, creating the
    /// directory. A blank `log_dir` means stdout only.
    pub fn for_dir(log_dir: &str) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::stdout_only());
        }
        let dir = Path::new(log_dir.trim());
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the log file open for the lifetime of the process.
pub struct LogGuard {
    sink: LogSink,
}

impl LogGuard {
    pub fn file_path(&self) -> Option<&Path> {
        self.sink.file_path()
    }
}

/// `RUST_LOG` wins; otherwise the configured level applies.
pub fn env_filter(config: &GatewayConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Installs the global subscriber. Returns `None` when one is already set.
pub fn init_logging(config: &GatewayConfig) -> Option<LogGuard> {
    let sink = LogSink::for_dir(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error: dir={} error={err}", config.log_dir);
        LogSink::stdout_only()
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(sink.clone())
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { sink })
}
