//! Tracing subscriber setup for fixture runs.
//!
//! Configuration comes from the environment:
//!
//! | Variable             | Values                          | Default             |
//! |----------------------|---------------------------------|---------------------|
//! | `FIXTURE_LOG_LEVEL`  | any `EnvFilter` directive        | `info`              |
//! | `FIXTURE_LOG_OUTPUT` | `console`, `file`, `both`, `none` | `console`           |
//! | `FIXTURE_LOG_FORMAT` | `human`, `json`                 | `human`             |
//! | `FIXTURE_LOG_TAGS`   | `key:value,...` (`*` wildcard)  | none                |
//! | `FIXTURE_LOG_FILE`   | path of the daily-rolled file    | `/tmp/fixture.log`  |
//!
//! Tags match span fields, so `FIXTURE_LOG_TAGS=fixture:postgres` keeps only
//! events emitted inside a `fixture = "postgres"` span.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

// --- Custom "Tee" Writer ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
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

// --- Tag-Based Filtering Logic ---
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Parse `key:value,key2:*` into tags; malformed entries are skipped.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let mut parts = s.splitn(2, ':');
            let key = parts.next()?.trim().to_string();
            let value = parts.next()?.trim().to_string();
            if key.is_empty() {
                return None;
            }
            Some(Tag { key, value })
        })
        .collect()
}

struct TagFilterLayer {
    filters: Vec<Tag>,
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
        let mut visitor = FieldVisitor(&mut fields);
        attrs.record(&mut visitor);
        span.extensions_mut().insert(fields);
    }

    // Matching depends on the current span, so never cache a verdict per callsite.
    fn register_callsite(&self, _meta: &'static Metadata<'static>) -> Interest {
        Interest::sometimes()
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        // Spans must exist for their fields to be matched against.
        if self.filters.is_empty() || meta.is_span() {
            return true;
        }

        let scope = match ctx.current_span().id().and_then(|id| ctx.span_scope(id)) {
            Some(scope) => scope,
            None => return false,
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl LoggingConfig {
    /// Read the `FIXTURE_LOG_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let level = env::var("FIXTURE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let output = match env::var("FIXTURE_LOG_OUTPUT").as_deref() {
            Ok("file") => LogOutput::File,
            Ok("both") => LogOutput::Both,
            Ok("none") => LogOutput::None,
            _ => LogOutput::Console,
        };
        let json = env::var("FIXTURE_LOG_FORMAT").is_ok_and(|f| f == "json");
        let tags = env::var("FIXTURE_LOG_TAGS")
            .map(|raw| parse_tags(&raw))
            .unwrap_or_default();
        let file_path = env::var("FIXTURE_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/fixture.log"));

        Self {
            level,
            output,
            json,
            tags,
            file_path,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for directive in ["reqwest=warn", "hyper=warn", "hyper_util=warn"] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }
}

/// Initializes the global tracing subscriber based on environment variables.
///
/// Returns the file writer guard when file output is enabled; keep it alive
/// for the lifetime of the process so buffered lines are flushed. Does
/// nothing if a global subscriber is already installed.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LoggingConfig::from_env())
}

pub fn init_with(config: &LoggingConfig) -> Option<WorkerGuard> {
    let tag_filter_layer = TagFilterLayer {
        filters: config.tags.clone(),
    };
    let subscriber = registry()
        .with(config.env_filter())
        .with(tag_filter_layer);

    let log_dir = config
        .file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = config
        .file_path
        .file_name()
        .unwrap_or("fixture.log".as_ref());

    let mut guard: Option<WorkerGuard> = None;

    let result = match config.output {
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(worker_guard);

            let tee_writer = MakeTee {
                make_a: std::io::stderr,
                make_b: non_blocking,
            };
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
            if config.json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer.pretty()).try_init()
            }
        }
        LogOutput::Console => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if config.json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer.compact()).try_init()
            }
        }
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(worker_guard);

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            if config.json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        LogOutput::None => subscriber.try_init(),
    };

    if result.is_err() {
        // Someone else already owns the global subscriber.
        return None;
    }
    guard
}

/// Subscriber for tests: output captured by the test harness, level from
/// `FIXTURE_LOG_LEVEL` (default `debug`). Safe to call from every test.
pub fn init_test_subscriber() {
    let level = env::var("FIXTURE_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("fixture:kv, run:*,broken,:empty");
        assert_eq!(
            tags,
            vec![
                Tag {
                    key: "fixture".into(),
                    value: "kv".into()
                },
                Tag {
                    key: "run".into(),
                    value: "*".into()
                },
            ]
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var("FIXTURE_LOG_OUTPUT", "both");
        env::set_var("FIXTURE_LOG_FORMAT", "json");
        env::set_var("FIXTURE_LOG_TAGS", "fixture:pg");
        env::set_var("FIXTURE_LOG_FILE", "/var/tmp/fx.log");

        let config = LoggingConfig::from_env();
        assert_eq!(config.output, LogOutput::Both);
        assert!(config.json);
        assert_eq!(config.tags.len(), 1);
        assert_eq!(config.file_path, PathBuf::from("/var/tmp/fx.log"));

        env::remove_var("FIXTURE_LOG_OUTPUT");
        env::remove_var("FIXTURE_LOG_FORMAT");
        env::remove_var("FIXTURE_LOG_TAGS");
        env::remove_var("FIXTURE_LOG_FILE");

        let defaults = LoggingConfig::from_env();
        assert_eq!(defaults.output, LogOutput::Console);
        assert!(!defaults.json);
        assert!(defaults.tags.is_empty());
    }

    #[test]
    fn test_tag_filter_keeps_only_tagged_span_events() {
        let capture = Capture::default();
        let subscriber = registry()
            .with(TagFilterLayer {
                filters: parse_tags("fixture:kv"),
            })
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(capture.clone())
                    .with_ansi(false),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any span");
            let span = tracing::info_span!("lifecycle", fixture = "kv");
            let _entered = span.enter();
            tracing::info!("inside kv span");
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("inside kv span"));
        assert!(!output.contains("outside any span"));
    }
}
