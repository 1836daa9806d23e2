//! Host-side collaborators the supervisor reports into.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::diagnostics::{Diagnostic, Severity};

/// Receives the diagnostic collection. `set` replaces whatever a URI held.
pub trait DiagnosticSink: Send {
    fn clear(&mut self);
    fn set(&mut self, uri: PathBuf, items: Vec<Diagnostic>);
}

pub trait LogSink: Send {
    fn append_line(&mut self, line: &str);
}

pub trait Notifier: Send {
    fn show_warning(&mut self, message: &str);
    fn show_error(&mut self, message: &str);
}

/// The sinks one supervisor writes to.
pub struct HostSinks {
    pub diagnostics: Box<dyn DiagnosticSink>,
    pub log: Box<dyn LogSink>,
    pub notifier: Box<dyn Notifier>,
}

/// Diagnostic collection shared between the supervisor and whoever renders it.
#[derive(Clone, Default)]
pub struct DiagnosticStore {
    data: Arc<Mutex<BTreeMap<PathBuf, Vec<Diagnostic>>>>,
}

impl DiagnosticStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files sorted with errors first, then by path.
    pub fn snapshot(&self) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut files: Vec<_> = data
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();
        files.sort_by(|a, b| {
            let a_err = a.1.iter().any(|d| d.severity == Severity::Error);
            let b_err = b.1.iter().any(|d| d.severity == Severity::Error);
            b_err.cmp(&a_err).then_with(|| a.0.cmp(&b.0))
        });
        files
    }

    #[cfg(test)]
    pub fn get(&self, uri: &std::path::Path) -> Vec<Diagnostic> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(uri).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short "E:1 W:2" summary, empty when clean.
    pub fn status_string(&self) -> String {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let mut errors = 0;
        let mut warnings = 0;
        for d in data.values().flatten() {
            match d.severity {
                Severity::Error => errors += 1,
                Severity::Warning => warnings += 1,
            }
        }
        if errors == 0 && warnings == 0 {
            String::new()
        } else {
            format!("E:{errors} W:{warnings}")
        }
    }
}

impl DiagnosticSink for DiagnosticStore {
    fn clear(&mut self) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn set(&mut self, uri: PathBuf, items: Vec<Diagnostic>) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        if items.is_empty() {
            data.remove(&uri);
        } else {
            data.insert(uri, items);
        }
    }
}

/// Output log panel stand-in: prints to stdout.
pub struct ConsoleLog;

impl LogSink for ConsoleLog {
    fn append_line(&mut self, line: &str) {
        println!("{}", line);
    }
}

/// Notification stand-in: routes to the tracing subscriber.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_warning(&mut self, message: &str) {
        tracing::warn!("{message}");
    }

    fn show_error(&mut self, message: &str) {
        tracing::error!("{message}");
    }
}

type Handler<T> = Box<dyn Fn(&T) + Send>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// Observer registry. Handlers run synchronously, in registration order,
/// exactly once per [`Emitter::fire`]. Handlers must not subscribe or
/// unsubscribe on the same emitter from inside a callback.
pub struct Emitter<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + 'static) -> Subscription {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, Box::new(handler)));

        let weak = Arc::downgrade(&self.registry);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .handlers
                        .retain(|(h, _)| *h != id);
                }
            })),
        }
    }

    pub fn fire(&self, event: &T) {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handler) in &registry.handlers {
            handler(event);
        }
    }
}

/// Unsubscribes when disposed or dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.release();
    }

    /// Keep the handler registered for the emitter's whole lifetime.
    pub fn forget(mut self) {
        self.unsubscribe = None;
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
