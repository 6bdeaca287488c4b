use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{Error as HotkeyError, GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use tracing::{debug, info, warn};

use crate::errors::{CutError, Result};

pub const TOGGLE_SHORTCUT: &str = "CommandOrControl+Space";

/// `Cmd+Space` on macOS, `Ctrl+Space` elsewhere.
pub fn toggle_hotkey() -> HotKey {
    #[cfg(target_os = "macos")]
    let modifiers = Modifiers::SUPER;
    #[cfg(not(target_os = "macos"))]
    let modifiers = Modifiers::CONTROL;
    HotKey::new(Some(modifiers), Code::Space)
}

/// Whether `spawn_listener` receives events in a process without a GUI event
/// loop. X11 delivers on its own thread; macOS needs `pump_main_loop` on the
/// main thread. Windows needs a message loop on the registering thread, which
/// this binary does not run.
pub const LISTENER_SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "macos"));

const PUMP_SLICE: Duration = Duration::from_millis(200);

/// Turns the current thread's run loop until `done` is set. Must be called on
/// the thread that created the hotkey manager.
#[cfg(target_os = "macos")]
pub fn pump_main_loop(done: &AtomicBool) {
    use core_foundation::runloop::{CFRunLoop, kCFRunLoopDefaultMode};

    while !done.load(Ordering::Acquire) {
        let _ = CFRunLoop::run_in_mode(unsafe { kCFRunLoopDefaultMode }, PUMP_SLICE, false);
    }
}

#[cfg(not(target_os = "macos"))]
pub fn pump_main_loop(done: &AtomicBool) {
    while !done.load(Ordering::Acquire) {
        thread::park_timeout(PUMP_SLICE);
    }
}

/// OS-level registration primitives.
pub trait HotkeyBackend {
    fn is_registered(&self, hotkey: &HotKey) -> bool;
    fn register(&mut self, hotkey: HotKey) -> std::result::Result<(), HotkeyError>;
    fn unregister(&mut self, hotkey: HotKey) -> std::result::Result<(), HotkeyError>;
}

/// `global-hotkey` manager. The OS offers no lookup, so registrations made
/// through this handle are tracked locally.
pub struct SystemHotkeys {
    manager: GlobalHotKeyManager,
    registered: HashSet<u32>,
}

impl SystemHotkeys {
    pub fn new() -> Result<Self> {
        let manager = GlobalHotKeyManager::new().map_err(|e| CutError::Hotkey(e.to_string()))?;
        Ok(Self {
            manager,
            registered: HashSet::new(),
        })
    }
}

impl HotkeyBackend for SystemHotkeys {
    fn is_registered(&self, hotkey: &HotKey) -> bool {
        self.registered.contains(&hotkey.id())
    }

    fn register(&mut self, hotkey: HotKey) -> std::result::Result<(), HotkeyError> {
        self.manager.register(hotkey)?;
        self.registered.insert(hotkey.id());
        Ok(())
    }

    fn unregister(&mut self, hotkey: HotKey) -> std::result::Result<(), HotkeyError> {
        self.registered.remove(&hotkey.id());
        self.manager.unregister(hotkey)
    }
}

pub trait WindowControl: Send + Sync {
    fn is_minimized(&self) -> bool;
    fn restore_and_focus(&self);
    fn minimize(&self);
}

pub fn toggle_window(window: &dyn WindowControl) {
    if window.is_minimized() {
        window.restore_and_focus();
    } else {
        window.minimize();
    }
}

/// Owns the window-toggle shortcut. `init` clears any existing registration
/// before registering, so calling it again (or after a crash left the key
/// bound) is safe.
pub struct HotkeyRegistrar<B> {
    backend: B,
    hotkey: HotKey,
}

impl<B: HotkeyBackend> HotkeyRegistrar<B> {
    pub fn new(backend: B, hotkey: HotKey) -> Self {
        Self { backend, hotkey }
    }

    pub fn hotkey_id(&self) -> u32 {
        self.hotkey.id()
    }

    pub fn init(&mut self) -> Result<u32> {
        if self.backend.is_registered(&self.hotkey) {
            debug!(id = self.hotkey.id(), "clearing previous hotkey registration");
            if let Err(e) = self.backend.unregister(self.hotkey) {
                warn!("failed to clear hotkey registration: {}", e);
            }
        }

        match self.backend.register(self.hotkey) {
            Ok(()) => {}
            Err(HotkeyError::AlreadyRegistered(_)) => {
                debug!(id = self.hotkey.id(), "hotkey bound elsewhere, re-registering");
                self.backend
                    .unregister(self.hotkey)
                    .map_err(|e| CutError::Hotkey(e.to_string()))?;
                self.backend
                    .register(self.hotkey)
                    .map_err(|e| CutError::Hotkey(e.to_string()))?;
            }
            Err(e) => return Err(CutError::Hotkey(e.to_string())),
        }

        info!(id = self.hotkey.id(), shortcut = TOGGLE_SHORTCUT, "hotkey registered");
        Ok(self.hotkey.id())
    }
}

/// Toggles the window on key release of the registered hotkey. Returns
/// whether the event was acted on.
pub fn handle_hotkey_event(
    hotkey_id: u32,
    event_id: u32,
    state: HotKeyState,
    window: &dyn WindowControl,
) -> bool {
    if event_id != hotkey_id || state != HotKeyState::Released {
        return false;
    }
    toggle_window(window);
    true
}

/// Forwards hotkey events to `window` on a background thread until the
/// event channel closes.
pub fn spawn_listener(hotkey_id: u32, window: Arc<dyn WindowControl>) -> JoinHandle<()> {
    thread::spawn(move || {
        let receiver = GlobalHotKeyEvent::receiver();
        while let Ok(event) = receiver.recv() {
            handle_hotkey_event(hotkey_id, event.id, event.state, window.as_ref());
        }
        debug!("hotkey listener exited");
    })
}
