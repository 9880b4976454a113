use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
    str::FromStr,
};

use crate::{
    module::{
        CageModule,
        ModuleContext,
        SandboxValue,
    },
    value::GuestValue,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Log => "LOG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "log" => Ok(LogLevel::Log),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => anyhow::bail!("unknown log level {s}"),
        }
    }
}

/// Where guest console output goes. The default sink forwards to the host's
/// `tracing` subscriber; tests capture instead.
pub type ConsoleSink = Rc<dyn Fn(LogLevel, String)>;

/// A captured log stream, shared between the module and the test that reads
/// it back.
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Rc<RefCell<Vec<(LogLevel, String)>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.borrow().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines.borrow().iter().map(|(_, m)| m.clone()).collect()
    }
}

/// Installs `console.log` / `info` / `warn` / `error` / `debug`. Arguments
/// are dumped and joined with spaces, the way the guest's own console would
/// render them.
pub struct ConsoleModule {
    sink: ConsoleSink,
}

impl ConsoleModule {
    pub fn new() -> Self {
        Self {
            sink: Rc::new(|level, message| match level {
                LogLevel::Debug => tracing::debug!("[guest] {message}"),
                LogLevel::Log | LogLevel::Info => tracing::info!("[guest] {message}"),
                LogLevel::Warn => tracing::warn!("[guest] {message}"),
                LogLevel::Error => tracing::error!("[guest] {message}"),
            }),
        }
    }

    pub fn with_sink(sink: ConsoleSink) -> Self {
        Self { sink }
    }

    /// A console whose output is captured for later inspection.
    pub fn capturing() -> (Self, LogCapture) {
        let capture = LogCapture::new();
        let lines = capture.lines.clone();
        let module = Self::with_sink(Rc::new(move |level, message| {
            lines.borrow_mut().push((level, message));
        }));
        (module, capture)
    }
}

fn format_args_line(args: &[GuestValue]) -> String {
    args.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl CageModule for ConsoleModule {
    fn def(&self, ctx: &mut ModuleContext<'_, '_, '_>) -> anyhow::Result<()> {
        let mut methods = Vec::new();
        for (name, level) in [
            ("debug", LogLevel::Debug),
            ("log", LogLevel::Log),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let sink = self.sink.clone();
            let function = ctx.sandbox_fn(name, move |args| {
                sink(level, format_args_line(args));
                Ok(GuestValue::Undefined)
            })?;
            methods.push((name.to_string(), SandboxValue::Handle(function)));
        }
        ctx.define_sandbox_object("console", SandboxValue::Object(methods))
    }
}
