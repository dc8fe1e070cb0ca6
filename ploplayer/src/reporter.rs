//! Collecteur d'erreurs dédupliqué
//!
//! Puits unique pour toute l'instrumentation d'erreurs du moteur :
//! filtre par sévérité, déduplication sur (description, fichier, ligne,
//! fonction) dans une fenêtre de 5 s, sortie console via tracing, et un
//! délégué optionnel qui reçoit aussi la pile d'appels. Le site d'appel
//! passe par la macro [`report_error!`], qui capture la fonction
//! englobante. Multi-producteurs, sections critiques courtes.
//!
//! [`report_error!`]: crate::report_error

use chrono::{DateTime, Duration, Utc};
use ploutils::TimeSource;
use std::backtrace::Backtrace;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Fenêtre de déduplication.
const DEDUP_WINDOW_SECS: i64 = 5;

/// Rapporte une erreur en capturant la fonction englobante.
///
/// ```ignore
/// crate::report_error!(self.reporter, &e, "schedule refresh", Severity::Warning);
/// ```
#[macro_export]
macro_rules! report_error {
    ($reporter:expr, $error:expr, $context:expr, $severity:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = name.strip_suffix("::f").unwrap_or(name);
        let function = name.trim_end_matches("::{{closure}}");
        $reporter.report_from($error, $context, $severity, function)
    }};
}

/// Sévérité d'un rapport. L'ordre des variantes définit le filtre :
/// tout ce qui est au-delà du niveau configuré est ignoré.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    None = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Debug = 4,
}

impl Severity {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Critical,
            2 => Self::Error,
            3 => Self::Warning,
            _ => Self::Debug,
        }
    }
}

/// Rapport transmis au délégué.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub description: String,
    pub context: String,
    pub severity: Severity,
    pub file: &'static str,
    pub line: u32,
    /// Fonction englobante du site d'appel (vide hors macro).
    pub function: &'static str,
    /// Pile d'appels au moment du rapport ; capturée seulement quand un
    /// délégué est installé.
    pub stack_trace: String,
    pub at: DateTime<Utc>,
}

/// Délégué recevant les rapports retenus.
pub trait ErrorReporterDelegate: Send + Sync {
    fn on_report(&self, report: &ErrorReport);
}

/// Puits d'erreurs du moteur.
pub struct ErrorReporter {
    level: AtomicU8,
    console: bool,
    time: Arc<dyn TimeSource>,
    delegate: Mutex<Option<Arc<dyn ErrorReporterDelegate>>>,
    recent: Mutex<HashMap<u64, DateTime<Utc>>>,
}

impl ErrorReporter {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            level: AtomicU8::new(Severity::Warning as u8),
            console: true,
            time,
            delegate: Mutex::new(None),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Coupe la sortie console (le délégué reste servi).
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    pub fn set_reporting_level(&self, level: Severity) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn reporting_level(&self) -> Severity {
        Severity::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn ErrorReporterDelegate>>) {
        *self.delegate.lock().unwrap() = delegate;
    }

    /// Rapporte une erreur depuis le site d'appel.
    ///
    /// Préférer la macro [`report_error!`], qui renseigne aussi la
    /// fonction englobante.
    ///
    /// [`report_error!`]: crate::report_error
    #[track_caller]
    pub fn report(&self, error: &dyn fmt::Display, context: &str, severity: Severity) {
        self.report_from(error, context, severity, "");
    }

    /// Variante avec fonction englobante explicite (cible de la macro).
    ///
    /// Un rapport identique (description, fichier, ligne, fonction)
    /// émis dans les 5 s produit exactement une invocation du délégué.
    #[track_caller]
    pub fn report_from(
        &self,
        error: &dyn fmt::Display,
        context: &str,
        severity: Severity,
        function: &'static str,
    ) {
        let location = Location::caller();
        self.report_at(
            error,
            context,
            severity,
            location.file(),
            location.line(),
            function,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn report_at(
        &self,
        error: &dyn fmt::Display,
        context: &str,
        severity: Severity,
        file: &'static str,
        line: u32,
        function: &'static str,
    ) {
        if severity > self.reporting_level() || severity == Severity::None {
            return;
        }

        let description = error.to_string();
        let now = self.time.now();

        if !self.take_dedup_slot(&description, file, line, function, now) {
            return;
        }

        let delegate = self.delegate.lock().unwrap().clone();
        // La pile n'est capturée que si quelqu'un la lira.
        let stack_trace = if delegate.is_some() {
            Backtrace::force_capture().to_string()
        } else {
            String::new()
        };

        let report = ErrorReport {
            description,
            context: context.to_string(),
            severity,
            file,
            line,
            function,
            stack_trace,
            at: now,
        };

        if self.console {
            match severity {
                Severity::Critical | Severity::Error => error!(
                    "ErrorReporter [{}:{} {}] {}: {}",
                    report.file, report.line, report.function, report.context, report.description
                ),
                Severity::Warning => warn!(
                    "ErrorReporter [{}:{} {}] {}: {}",
                    report.file, report.line, report.function, report.context, report.description
                ),
                _ => debug!(
                    "ErrorReporter [{}:{} {}] {}: {}",
                    report.file, report.line, report.function, report.context, report.description
                ),
            }
        }

        if let Some(delegate) = delegate {
            delegate.on_report(&report);
        }
    }

    fn take_dedup_slot(
        &self,
        description: &str,
        file: &str,
        line: u32,
        function: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut hasher = DefaultHasher::new();
        description.hash(&mut hasher);
        file.hash(&mut hasher);
        line.hash(&mut hasher);
        function.hash(&mut hasher);
        let key = hasher.finish();

        let window = Duration::seconds(DEDUP_WINDOW_SECS);
        let mut recent = self.recent.lock().unwrap();
        recent.retain(|_, at| now - *at < window);

        match recent.get(&key) {
            Some(_) => false,
            None => {
                recent.insert(key, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ploutils::ManualTimeSource;
    use std::sync::atomic::AtomicUsize;

    struct CollectingDelegate {
        calls: AtomicUsize,
        last: Mutex<Option<ErrorReport>>,
    }

    impl CollectingDelegate {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }
    }

    impl ErrorReporterDelegate for CollectingDelegate {
        fn on_report(&self, report: &ErrorReport) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(report.clone());
        }
    }

    fn reporter() -> (ErrorReporter, ManualTimeSource, Arc<CollectingDelegate>) {
        let clock = ManualTimeSource::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let reporter = ErrorReporter::new(Arc::new(clock.clone())).without_console();
        let delegate = Arc::new(CollectingDelegate::new());
        reporter.set_delegate(Some(delegate.clone()));
        (reporter, clock, delegate)
    }

    #[test]
    fn test_identical_reports_deduped_within_window() {
        let (reporter, clock, delegate) = reporter();

        for _ in 0..5 {
            reporter.report_from(&"boom", "ctx", Severity::Error, "scheduler::refresh");
        }
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);

        // Hors fenêtre, le même rapport repasse
        clock.advance(Duration::seconds(6));
        reporter.report_from(&"boom", "ctx", Severity::Error, "scheduler::refresh");
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_distinct_lines_are_not_deduped() {
        let (reporter, _clock, delegate) = reporter();

        reporter.report(&"boom", "ctx", Severity::Error);
        reporter.report(&"boom", "ctx", Severity::Error); // autre ligne d'appel
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_macro_captures_enclosing_function() {
        let (reporter, _clock, delegate) = reporter();

        crate::report_error!(reporter, &"boom", "ctx", Severity::Error);

        let report = delegate.last.lock().unwrap().clone().unwrap();
        assert!(
            report.function.contains("test_macro_captures_enclosing_function"),
            "function = {}",
            report.function
        );
        // La pile d'appels accompagne le rapport quand un délégué écoute
        assert!(!report.stack_trace.is_empty());
    }

    #[test]
    fn test_same_line_distinct_functions_are_not_deduped() {
        let (reporter, _clock, delegate) = reporter();

        reporter.report_from(&"boom", "ctx", Severity::Error, "alpha");
        reporter.report_from(&"boom", "ctx", Severity::Error, "beta");
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_severity_filter() {
        let (reporter, _clock, delegate) = reporter();
        reporter.set_reporting_level(Severity::Error);

        reporter.report(&"too chatty", "ctx", Severity::Warning);
        reporter.report(&"too chatty", "ctx", Severity::Debug);
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);

        reporter.report(&"serious", "ctx", Severity::Critical);
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_none_level_drops_everything() {
        let (reporter, _clock, delegate) = reporter();
        reporter.set_reporting_level(Severity::None);
        reporter.report(&"anything", "ctx", Severity::Critical);
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);
    }
}
