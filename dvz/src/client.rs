// The OS-facing event loop (L8, 4.7).
//
// Grounded on `dvz-utils`' timing helpers for the monotonic clock and
// on `deq.rs`'s `Deq` (4.9) for the ASYNC half of callback dispatch:
// an ASYNC registration is really just "run this on whatever drains
// queue 0", which `Deq::callback` already expresses directly. SYNC
// registrations run inline on whichever thread calls `emit`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::deq::{Deq, Strategy};
use crate::timer::Timer;

bitflags::bitflags! {
    /// Modifier keys held during a mouse/keyboard event.
    pub struct Modifiers: u32 {
        const SHIFT = 1 << 0;
        const CTRL  = 1 << 1;
        const ALT   = 1 << 2;
        const SUPER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseAction {
    Press,
    Release,
    Move,
    Click,
    DoubleClick,
    DragStart,
    Drag,
    DragStop,
    Wheel,
}

#[derive(Debug, Clone, Copy)]
pub struct MouseEvent {
    pub action: MouseAction,
    pub button: Option<MouseButton>,
    pub position: (f32, f32),
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyboardEvent {
    pub action: KeyAction,
    pub keycode: i32,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub timer_id: usize,
    pub time: f64,
    pub fire_count: u64,
}

/// The 4.7 event taxonomy. `kind()` is the dispatch key callbacks
/// register against.
#[derive(Debug, Clone, Copy)]
pub enum ClientEvent {
    Init,
    Frame { time: f64 },
    WindowResize { width: u32, height: u32 },
    Mouse(MouseEvent),
    Keyboard(KeyboardEvent),
    Timer(TimerEvent),
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init,
    Frame,
    WindowResize,
    Mouse,
    Keyboard,
    Timer,
    Destroy,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Init => EventKind::Init,
            ClientEvent::Frame { .. } => EventKind::Frame,
            ClientEvent::WindowResize { .. } => EventKind::WindowResize,
            ClientEvent::Mouse(_) => EventKind::Mouse,
            ClientEvent::Keyboard(_) => EventKind::Keyboard,
            ClientEvent::Timer(_) => EventKind::Timer,
            ClientEvent::Destroy => EventKind::Destroy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    Sync,
    Async,
}

type Callback = Box<dyn FnMut(&ClientEvent) + Send>;

struct Registration {
    mode: CallbackMode,
    callback: Mutex<Callback>,
}

/// The OS-facing event loop. Pumps SDL's event queue when the `sdl`
/// feature is enabled (each `Client` opens its own SDL context, the
/// same "leak it, the window keeps the subsystem alive" simplification
/// `canvas.rs` uses); otherwise it only synthesizes `FRAME`/`TIMER`/
/// `DESTROY` events, enough to drive an offscreen renderer headless.
pub struct Client {
    callbacks: Mutex<HashMap<EventKind, Vec<Registration>>>,
    async_deq: Arc<Deq<ClientEvent>>,
    to_stop: Arc<AtomicBool>,
    timers: Mutex<Vec<Timer>>,
    /// Resize events observed since the last drain, for a presenter to
    /// pick up and apply to its canvas (4.8 step 9) without needing a
    /// self-referential callback back into the presenter.
    pending_resizes: Mutex<Vec<(u32, u32)>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    max_wait: Duration,
    start: Instant,
    #[cfg(feature = "sdl")]
    sdl_pump: Mutex<Option<sdl2::EventPump>>,
}

impl Client {
    pub fn new() -> Arc<Self> {
        let async_deq = Deq::new(1);
        let client = Arc::new(Client {
            callbacks: Mutex::new(HashMap::new()),
            async_deq: async_deq.clone(),
            to_stop: Arc::new(AtomicBool::new(false)),
            timers: Mutex::new(Vec::new()),
            pending_resizes: Mutex::new(Vec::new()),
            join_handle: Mutex::new(None),
            max_wait: Duration::from_millis(16),
            start: Instant::now(),
            #[cfg(feature = "sdl")]
            sdl_pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        async_deq.callback(0, move |ev: &ClientEvent| {
            if let Some(client) = weak.upgrade() {
                client.dispatch(ev, CallbackMode::Async);
            }
        });

        client
    }

    /// Registers `callback` for every event of `kind`. SYNC callbacks
    /// run inline on whichever thread calls `emit`/`step`; ASYNC
    /// callbacks run whenever the internal deq is drained (4.9).
    pub fn register(
        &self,
        kind: EventKind,
        mode: CallbackMode,
        callback: impl FnMut(&ClientEvent) + Send + 'static,
    ) {
        self.callbacks
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(Registration { mode, callback: Mutex::new(Box::new(callback)) });
    }

    /// Adds a timer item, ticked every `step`. Returns an id usable in
    /// `TimerEvent::timer_id`.
    pub fn add_timer(&self, delay: f64, period: f64, max_count: u64) -> usize {
        let mut timers = self.timers.lock().unwrap();
        timers.push(Timer::new(delay, period, max_count));
        timers.len() - 1
    }

    pub fn should_stop(&self) -> bool {
        self.to_stop.load(Ordering::Acquire)
    }

    /// Requests termination; subsequent `emit`/`step` calls short-circuit.
    pub fn stop(&self) {
        self.to_stop.store(true, Ordering::Release);
        self.async_deq.destroy();
    }

    /// Drains resize events observed since the last call.
    pub fn take_resizes(&self) -> Vec<(u32, u32)> {
        std::mem::take(&mut *self.pending_resizes.lock().unwrap())
    }

    /// Dispatches `ev` to every callback registered for its kind under
    /// `mode` (SYNC callbacks from `step`, ASYNC ones from the deq
    /// drain in `async_deq`'s own callback above).
    fn dispatch(&self, ev: &ClientEvent, mode: CallbackMode) {
        let callbacks = self.callbacks.lock().unwrap();
        if let Some(regs) = callbacks.get(&ev.kind()) {
            for reg in regs.iter().filter(|r| r.mode == mode) {
                (reg.callback.lock().unwrap())(ev);
            }
        }
    }

    /// Runs SYNC callbacks inline and queues the event for ASYNC ones;
    /// `WindowResize` is additionally recorded for `take_resizes`, and
    /// `Destroy` requests termination.
    pub fn emit(&self, ev: ClientEvent) {
        if let ClientEvent::WindowResize { width, height } = ev {
            self.pending_resizes.lock().unwrap().push((width, height));
        }
        if matches!(ev, ClientEvent::Destroy) {
            self.to_stop.store(true, Ordering::Release);
        }
        self.dispatch(&ev, CallbackMode::Sync);
        self.async_deq.enqueue(0, ev);
    }

    fn tick_timers(&self, time: f64) {
        let mut timers = self.timers.lock().unwrap();
        for (timer_id, timer) in timers.iter_mut().enumerate() {
            let fires = timer.tick(time);
            for _ in 0..fires {
                let fire_count = timer.fire_count();
                self.emit(ClientEvent::Timer(TimerEvent { timer_id, time, fire_count }));
            }
        }
    }

    #[cfg(feature = "sdl")]
    fn pump_sdl_events(&self) {
        let mut guard = self.sdl_pump.lock().unwrap();
        if guard.is_none() {
            if let Ok(ctx) = sdl2::init() {
                if let Ok(pump) = ctx.event_pump() {
                    std::mem::forget(ctx);
                    *guard = Some(pump);
                }
            }
        }
        let events: Vec<sdl2::event::Event> = match guard.as_mut() {
            Some(pump) => pump.poll_iter().collect(),
            None => return,
        };
        drop(guard);

        for raw in events {
            if let Some(ev) = translate_sdl_event(raw) {
                self.emit(ev);
            }
        }
    }

    /// Runs one iteration of the loop body `run` repeats: pumps OS
    /// events, ticks timers, emits `FRAME`, and drains ASYNC callbacks.
    /// Returns the frame's monotonic time. Exposed separately from
    /// `run` so a presenter can interleave its own per-frame protocol
    /// (4.8) between steps instead of registering a self-referential
    /// FRAME callback.
    pub fn step(&self) -> f64 {
        #[cfg(feature = "sdl")]
        self.pump_sdl_events();

        let time = self.start.elapsed().as_secs_f64();
        self.tick_timers(time);
        self.emit(ClientEvent::Frame { time });
        self.async_deq.proc(&[0], Strategy::DepthFirst);
        time
    }

    /// Runs until `n_frames` frames have been presented (0 = forever)
    /// or `stop()` is called.
    pub fn run(self: &Arc<Self>, n_frames: u64) {
        self.emit(ClientEvent::Init);
        let mut frames = 0u64;
        loop {
            if self.should_stop() {
                break;
            }
            self.step();
            frames += 1;
            if n_frames != 0 && frames >= n_frames {
                break;
            }
            thread::sleep(self.max_wait);
        }
        self.emit(ClientEvent::Destroy);
    }

    /// Runs `run(n_frames)` on a worker thread; `join()` waits for it.
    pub fn thread(self: &Arc<Self>, n_frames: u64) {
        let client = self.clone();
        let handle = thread::spawn(move || client.run(n_frames));
        *self.join_handle.lock().unwrap() = Some(handle);
    }

    pub fn join(&self) {
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(feature = "sdl")]
fn translate_sdl_event(raw: sdl2::event::Event) -> Option<ClientEvent> {
    use sdl2::event::{Event, WindowEvent};
    use sdl2::keyboard::Mod;
    use sdl2::mouse::MouseButton as SdlMouseButton;

    fn modifiers(m: Mod) -> Modifiers {
        let mut out = Modifiers::empty();
        if m.intersects(Mod::LSHIFTMOD | Mod::RSHIFTMOD) {
            out |= Modifiers::SHIFT;
        }
        if m.intersects(Mod::LCTRLMOD | Mod::RCTRLMOD) {
            out |= Modifiers::CTRL;
        }
        if m.intersects(Mod::LALTMOD | Mod::RALTMOD) {
            out |= Modifiers::ALT;
        }
        if m.intersects(Mod::LGUIMOD | Mod::RGUIMOD) {
            out |= Modifiers::SUPER;
        }
        out
    }

    fn button(b: SdlMouseButton) -> Option<MouseButton> {
        match b {
            SdlMouseButton::Left => Some(MouseButton::Left),
            SdlMouseButton::Middle => Some(MouseButton::Middle),
            SdlMouseButton::Right => Some(MouseButton::Right),
            _ => None,
        }
    }

    match raw {
        Event::Quit { .. } => Some(ClientEvent::Destroy),
        Event::Window { win_event: WindowEvent::Resized(w, h), .. } => {
            Some(ClientEvent::WindowResize { width: w as u32, height: h as u32 })
        }
        Event::MouseButtonDown { x, y, mouse_btn, .. } => Some(ClientEvent::Mouse(MouseEvent {
            action: MouseAction::Press,
            button: button(mouse_btn),
            position: (x as f32, y as f32),
            modifiers: Modifiers::empty(),
        })),
        Event::MouseButtonUp { x, y, mouse_btn, .. } => Some(ClientEvent::Mouse(MouseEvent {
            action: MouseAction::Release,
            button: button(mouse_btn),
            position: (x as f32, y as f32),
            modifiers: Modifiers::empty(),
        })),
        Event::MouseMotion { x, y, mousestate, .. } => Some(ClientEvent::Mouse(MouseEvent {
            action: if mousestate.left() || mousestate.right() || mousestate.middle() {
                MouseAction::Drag
            } else {
                MouseAction::Move
            },
            button: None,
            position: (x as f32, y as f32),
            modifiers: Modifiers::empty(),
        })),
        Event::MouseWheel { x, y, .. } => Some(ClientEvent::Mouse(MouseEvent {
            action: MouseAction::Wheel,
            button: None,
            position: (x as f32, y as f32),
            modifiers: Modifiers::empty(),
        })),
        Event::KeyDown { keycode: Some(k), keymod, .. } => Some(ClientEvent::Keyboard(KeyboardEvent {
            action: KeyAction::Press,
            keycode: k as i32,
            modifiers: modifiers(keymod),
        })),
        Event::KeyUp { keycode: Some(k), keymod, .. } => Some(ClientEvent::Keyboard(KeyboardEvent {
            action: KeyAction::Release,
            keycode: k as i32,
            modifiers: modifiers(keymod),
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn modifiers_bitflags_compose() {
        let mods = Modifiers::SHIFT | Modifiers::CTRL;
        assert!(mods.contains(Modifiers::SHIFT));
        assert!(mods.contains(Modifiers::CTRL));
        assert!(!mods.contains(Modifiers::ALT));
    }

    #[test]
    fn event_kind_matches_variant() {
        assert_eq!(ClientEvent::Init.kind(), EventKind::Init);
        assert_eq!(ClientEvent::Frame { time: 1.0 }.kind(), EventKind::Frame);
        assert_eq!(
            ClientEvent::WindowResize { width: 1, height: 1 }.kind(),
            EventKind::WindowResize
        );
        assert_eq!(ClientEvent::Destroy.kind(), EventKind::Destroy);
    }

    #[test]
    fn sync_callback_runs_inline_on_emit() {
        let client = Client::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_cb = count.clone();
        client.register(EventKind::Frame, CallbackMode::Sync, move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        client.emit(ClientEvent::Frame { time: 0.0 });
        // SYNC callbacks run before emit() returns, no drain required.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn async_callback_runs_only_after_drain() {
        let client = Client::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_cb = count.clone();
        client.register(EventKind::Frame, CallbackMode::Async, move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        client.emit(ClientEvent::Frame { time: 0.0 });
        assert_eq!(count.load(Ordering::SeqCst), 0, "async callbacks must not run inline");
        client.async_deq.proc(&[0], Strategy::DepthFirst);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_mode_filters_by_kind() {
        let client = Client::new();
        let mouse_count = Arc::new(AtomicU32::new(0));
        let mouse_count_cb = mouse_count.clone();
        client.register(EventKind::Mouse, CallbackMode::Sync, move |_| {
            mouse_count_cb.fetch_add(1, Ordering::SeqCst);
        });

        client.emit(ClientEvent::Frame { time: 0.0 });
        assert_eq!(mouse_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn destroy_event_sets_should_stop() {
        let client = Client::new();
        assert!(!client.should_stop());
        client.emit(ClientEvent::Destroy);
        assert!(client.should_stop());
    }

    #[test]
    fn resize_events_are_recorded_and_drained_once() {
        let client = Client::new();
        client.emit(ClientEvent::WindowResize { width: 800, height: 600 });
        client.emit(ClientEvent::WindowResize { width: 1024, height: 768 });
        let resizes = client.take_resizes();
        assert_eq!(resizes, vec![(800, 600), (1024, 768)]);
        assert!(client.take_resizes().is_empty());
    }

    #[test]
    fn add_timer_fires_a_timer_event() {
        let client = Client::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_cb = fired.clone();
        client.register(EventKind::Timer, CallbackMode::Sync, move |_| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        client.add_timer(0.0, 1.0, 1);
        client.tick_timers(0.0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_marks_should_stop() {
        let client = Client::new();
        client.stop();
        assert!(client.should_stop());
    }
}
