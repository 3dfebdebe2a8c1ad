use crate::types::{FilledOrder, OrderKind, Side};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const EVT_FILLED: &str = "trade:filled";
pub const EVT_STOPLOSS: &str = "trade:stoploss";
pub const EVT_INSUFFICIENT_BALANCE: &str = "trade:insufficient-balance";
pub const EVT_FAILED_AUTH: &str = "trade:failed-exchange-auth";
pub const EVT_CLIENT_ORDER_ID_FAIL: &str = "trade:clientOrderId-fail";
pub const EVT_FAIL_EXCHANGE: &str = "trade:fail-exchange";
/// Sink for listener failures; must itself never throw.
pub const EVT_ERROR: &str = "ERROR";

/// Payload of `trade:filled`, the contract consumed by external notifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillInfo {
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub order_type: OrderKind,
    pub date: i64,
    pub fee: f64,
    pub fee_asset: String,
    pub balance_after: f64,
    pub change: f64,
}

/// Context attached to error-class trade events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCtx {
    pub bot_id: String,
    pub user: String,
    pub exchange: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Fill(FillInfo),
    StopLoss(FilledOrder),
    Error(ErrorCtx),
    ClientOrderIdFail { cid: String, err_type: String, ctx: String },
    Message(String),
}

type Listener = Arc<dyn Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    once: bool,
    f: Listener,
}

/// Minimal synchronous in-process emitter. Listeners fire in insertion
/// order; `emit` iterates a snapshot so listeners may mutate the registry.
/// A listener returning Err is re-emitted on the ERROR event.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, Arc::new(f), false)
    }

    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, Arc::new(f), true)
    }

    fn register(&self, event: &str, f: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.listeners.lock().unwrap();
        map.entry(event.to_string())
            .or_default()
            .push(Registration { id, once, f });
        id
    }

    /// Remove listeners. With both arguments None the whole registry is
    /// cleared; with only `event` all of that event's listeners go; with an
    /// id, just that listener (searched across events when `event` is None).
    pub fn off(&self, event: Option<&str>, id: Option<ListenerId>) {
        let mut map = self.listeners.lock().unwrap();
        match (event, id) {
            (None, None) => map.clear(),
            (Some(ev), None) => {
                map.remove(ev);
            }
            (Some(ev), Some(id)) => {
                if let Some(regs) = map.get_mut(ev) {
                    regs.retain(|r| r.id != id);
                }
            }
            (None, Some(id)) => {
                for regs in map.values_mut() {
                    regs.retain(|r| r.id != id);
                }
            }
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(event)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn emit(&self, event: &str, payload: &EventPayload) {
        // Snapshot under the lock; once-listeners are unregistered before
        // they fire so re-entrant emits cannot double-deliver.
        let snapshot: Vec<(ListenerId, Listener)> = {
            let mut map = self.listeners.lock().unwrap();
            match map.get_mut(event) {
                None => return,
                Some(regs) => {
                    let snap = regs.iter().map(|r| (r.id, r.f.clone())).collect();
                    regs.retain(|r| !r.once);
                    snap
                }
            }
        };

        for (id, f) in snapshot {
            if let Err(e) = f(payload) {
                if event == EVT_ERROR {
                    tracing::error!(error = ?e, "ERROR listener failed");
                } else {
                    tracing::warn!(event, listener = id.0, error = ?e, "listener failed");
                    self.emit(EVT_ERROR, &EventPayload::Message(format!("{e:#}")));
                }
            }
        }
    }
}

/// Per-scope registration guard: every handler attached through it is
/// detached on drop, so a bot tick never leaks listeners.
pub struct ScopedBus {
    bus: Arc<EventBus>,
    attached: Mutex<Vec<(String, ListenerId)>>,
}

impl ScopedBus {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, attached: Mutex::new(Vec::new()) }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn on<F>(&self, event: &str, f: F)
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.bus.on(event, f);
        self.attached.lock().unwrap().push((event.to_string(), id));
    }

    pub fn once<F>(&self, event: &str, f: F)
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.bus.once(event, f);
        self.attached.lock().unwrap().push((event.to_string(), id));
    }

    pub fn emit(&self, event: &str, payload: &EventPayload) {
        self.bus.emit(event, payload);
    }
}

impl Drop for ScopedBus {
    fn drop(&mut self) {
        for (event, id) in self.attached.lock().unwrap().drain(..) {
            self.bus.off(Some(&event), Some(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn once_fires_exactly_once() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.once("ev", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.emit("ev", &EventPayload::Message("a".into()));
        bus.emit("ev", &EventPayload::Message("b".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("ev"), 0);
    }

    #[test]
    fn listener_error_reaches_error_sink() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        bus.on(EVT_ERROR, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.on("ev", |_| anyhow::bail!("boom"));
        bus.emit("ev", &EventPayload::Message("x".into()));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_detaches_on_drop() {
        let bus = EventBus::new();
        {
            let scope = ScopedBus::new(bus.clone());
            scope.on("ev", |_| Ok(()));
            assert_eq!(bus.listener_count("ev"), 1);
        }
        assert_eq!(bus.listener_count("ev"), 0);
    }

    #[test]
    fn listeners_may_mutate_registry_during_emit() {
        let bus = EventBus::new();
        let bus2 = bus.clone();
        bus.on("ev", move |_| {
            bus2.off(Some("ev"), None);
            Ok(())
        });
        bus.emit("ev", &EventPayload::Message("x".into()));
        assert_eq!(bus.listener_count("ev"), 0);
    }
}
