//! Tracing subscriber setup shared by every broker entry point.
//!
//! Configuration comes from the environment:
//!
//! - `LOG_LEVEL`: default filter directive (`RUST_LOG` takes precedence)
//! - `LOG_OUTPUT`: `console`, `file` or `both`
//! - `LOG_FORMAT`: `human` or `json`
//! - `LOG_TAGS`: `key:value` pairs, only events inside spans carrying
//!   matching fields are emitted (`instance_id:*` matches any value)
//! - `LOG_FILE_PATH`: file sink location, rolled daily

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/service-broker.log";

/// Where formatted events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value {
            "console" => LogOutput::Console,
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::None,
        }
    }

    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

/// Subscriber settings, normally read with [`LoggingConfig::from_env`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            json: false,
            tags: Vec::new(),
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("LOG_LEVEL").unwrap_or(defaults.level),
            output: env::var("LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            json: env::var("LOG_FORMAT").is_ok_and(|v| v == "json"),
            tags: env::var("LOG_TAGS")
                .map(|v| parse_tags(&v))
                .unwrap_or_default(),
            file_path: env::var("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }
}

/// A `key:value` span field filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Parses `LOG_TAGS` syntax, silently skipping malformed entries.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl TagFilterLayer {
    fn matches(&self, fields: &HashMap<String, String>) -> bool {
        self.filters.iter().all(|filter| {
            fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        // Events outside any span are dropped once tags are configured.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.matches(&all_fields)
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in ["sqlx=warn", "tokio=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }
    filter
}

/// Initializes the global tracing subscriber from the environment.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LoggingConfig::from_env())
}

/// Initializes the global tracing subscriber.
///
/// Returns the file writer guard when a file sink is active; dropping it
/// flushes and stops the background writer. Does nothing if a global
/// subscriber is already installed.
pub fn init_with(config: &LoggingConfig) -> Option<WorkerGuard> {
    let subscriber = registry()
        .with(build_filter(&config.level))
        .with(TagFilterLayer {
            filters: config.tags.clone(),
        });

    let log_dir = config
        .file_path
        .parent()
        .unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = config
        .file_path
        .file_name()
        .unwrap_or("service-broker.log".as_ref());

    let mut guard = None;
    let result = match (config.output.console(), config.output.file()) {
        (true, true) => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            let writer = MakeTee {
                make_a: io::stdout,
                make_b: non_blocking,
            };
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            if config.json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            }
        }
        (true, false) => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);
            if config.json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            }
        }
        (false, true) => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            let layer = tracing_subscriber::fmt::layer().with_writer(non_blocking);
            if config.json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            }
        }
        (false, false) => subscriber.try_init(),
    };

    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }

    guard
}
