//! Shared hook storage for socket callbacks
//!
//! Hooks are registered from the application thread and invoked from the
//! socket driver task. Each invocation takes the hook out of the slot for
//! the duration of the call, so a hook body may freely use the socket
//! handle (whose setters lock this same storage) without deadlocking.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::codec::WebSocketAdapter;

pub(crate) type DataHook = Box<dyn FnMut(&[u8]) + Send>;
pub(crate) type EventHook = Box<dyn FnMut() + Send>;
pub(crate) type TextHook = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
struct HookSet {
    on_data: Option<DataHook>,
    on_message: Option<DataHook>,
    on_open: Option<EventHook>,
    on_close: Option<EventHook>,
    on_info: Option<TextHook>,
    on_warning: Option<TextHook>,
    websocket: Option<Box<dyn WebSocketAdapter>>,
    read_timeout: Option<Duration>,
}

/// Hook storage shared between a socket handle and its driver task.
#[derive(Clone, Default)]
pub(crate) struct SharedHooks {
    inner: Arc<Mutex<HookSet>>,
}

impl SharedHooks {
    fn lock(&self) -> MutexGuard<'_, HookSet> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_data(&self, hook: DataHook) {
        self.lock().on_data = Some(hook);
    }

    pub(crate) fn clear_data(&self) {
        self.lock().on_data = None;
    }

    pub(crate) fn set_message(&self, hook: DataHook) {
        self.lock().on_message = Some(hook);
    }

    pub(crate) fn set_open(&self, hook: EventHook) {
        self.lock().on_open = Some(hook);
    }

    pub(crate) fn set_close(&self, hook: EventHook) {
        self.lock().on_close = Some(hook);
    }

    pub(crate) fn set_info(&self, hook: TextHook) {
        self.lock().on_info = Some(hook);
    }

    pub(crate) fn set_warning(&self, hook: TextHook) {
        self.lock().on_warning = Some(hook);
    }

    pub(crate) fn set_websocket(&self, adapter: Box<dyn WebSocketAdapter>) {
        self.lock().websocket = Some(adapter);
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.lock().read_timeout = timeout;
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.lock().read_timeout
    }

    /// The adapter moves into the driver when the socket opens.
    pub(crate) fn take_websocket(&self) -> Option<Box<dyn WebSocketAdapter>> {
        self.lock().websocket.take()
    }

    pub(crate) fn has_data_hook(&self) -> bool {
        self.lock().on_data.is_some()
    }

    pub(crate) fn data(&self, bytes: &[u8]) {
        self.call_data(|s| &mut s.on_data, bytes);
    }

    pub(crate) fn message(&self, bytes: &[u8]) {
        self.call_data(|s| &mut s.on_message, bytes);
    }

    pub(crate) fn open(&self) {
        self.call_event(|s| &mut s.on_open);
    }

    pub(crate) fn close(&self) {
        self.call_event(|s| &mut s.on_close);
    }

    pub(crate) fn info(&self, text: &str) {
        self.call_text(|s| &mut s.on_info, text);
    }

    pub(crate) fn warning(&self, text: &str) {
        self.call_text(|s| &mut s.on_warning, text);
    }

    fn call_data(&self, pick: fn(&mut HookSet) -> &mut Option<DataHook>, arg: &[u8]) {
        let taken = pick(&mut self.lock()).take();
        if let Some(mut hook) = taken {
            hook(arg);
            let mut guard = self.lock();
            let slot = pick(&mut guard);
            // A hook replaced from inside its own body wins over the restore.
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn call_event(&self, pick: fn(&mut HookSet) -> &mut Option<EventHook>) {
        let taken = pick(&mut self.lock()).take();
        if let Some(mut hook) = taken {
            hook();
            let mut guard = self.lock();
            let slot = pick(&mut guard);
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn call_text(&self, pick: fn(&mut HookSet) -> &mut Option<TextHook>, arg: &str) {
        let taken = pick(&mut self.lock()).take();
        if let Some(mut hook) = taken {
            hook(arg);
            let mut guard = self.lock();
            let slot = pick(&mut guard);
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

}
