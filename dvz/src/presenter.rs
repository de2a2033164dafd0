// The presenter (L9, 4.8): owns one renderer and one client, plus a
// small table of per-window GUI hooks, and drives the per-frame
// protocol described in 4.8.
//
// ImGui integration itself is out of scope here: no ImGui binding is
// pulled in, so the GUI hook point is wired (`register_window`'s
// `gui_callback`) without an actual ImGui render pass behind it -- see
// DESIGN.md.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::capture;
use crate::client::Client;
use crate::error::{DvzError, ErrorCallback, Result};
use crate::idmap::Id;
use crate::instance::Instance;
use crate::request::{ObjectType, Request, Requester};
use crate::renderer::Renderer;
use crate::CreateInfo;

/// The maximum number of windows a single presenter can track (4.8:
/// "a small fixed-size table"). Exceeding this is `ResourceExhausted`.
const MAX_WINDOWS: usize = 16;

struct WindowEntry {
    canvas_id: Id,
    object_type: ObjectType,
    gui_callback: Option<Box<dyn Fn(Id) + Send + Sync>>,
}

/// Frame-loop driver combining renderer + client + canvas (glossary).
pub struct Presenter {
    renderer: Renderer,
    client: Arc<Client>,
    requester: Arc<Mutex<Requester>>,
    windows: Mutex<Vec<WindowEntry>>,
    error_callback: Option<ErrorCallback>,
    capture_path: Option<PathBuf>,
}

impl Presenter {
    pub fn new(instance: Arc<Instance>, info: &CreateInfo) -> Result<Self> {
        Ok(Presenter {
            renderer: Renderer::new(instance, info)?,
            client: Client::new(),
            requester: Arc::new(Mutex::new(Requester::new())),
            windows: Mutex::new(Vec::new()),
            error_callback: None,
            capture_path: capture::capture_path_from_env(),
        })
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// The shared batch user `on_frame`/input callbacks append requests
    /// to; the presenter copies and clears it once per frame (step 3).
    pub fn requester(&self) -> Arc<Mutex<Requester>> {
        self.requester.clone()
    }

    pub fn set_error_callback(&mut self, callback: ErrorCallback) {
        self.error_callback = Some(callback);
    }

    /// Registers a window's canvas for the per-frame protocol, with an
    /// optional GUI hook invoked just before that canvas's command
    /// buffer is replayed (between steps 6 and 7).
    pub fn register_window(
        &self,
        canvas_id: Id,
        object_type: ObjectType,
        gui_callback: Option<Box<dyn Fn(Id) + Send + Sync>>,
    ) -> Result<()> {
        let mut windows = self.windows.lock().unwrap();
        if windows.len() >= MAX_WINDOWS {
            return Err(DvzError::ResourceExhausted(
                "presenter window table is full".to_string(),
            ));
        }
        windows.push(WindowEntry { canvas_id, object_type, gui_callback });
        Ok(())
    }

    fn handle_error(&mut self, e: DvzError) -> Result<()> {
        if e.is_recoverable() {
            // 9 scenario: out-of-date/timeout is caught here and the
            // next frame's `needs_rebuild` check (driven by
            // `Canvas::generation`) resolves it via a resize.
            return Ok(());
        }
        if e.is_logged_only() {
            return Ok(());
        }
        if let Some(cb) = &self.error_callback {
            cb(&e);
        }
        Err(e)
    }

    /// Runs the 4.8 per-frame protocol until `n_frames` have been
    /// presented (0 = forever) or the client is stopped.
    pub fn run(&mut self, n_frames: u64) -> Result<()> {
        self.client.emit(crate::client::ClientEvent::Init);
        let mut frame_no = 0u64;

        loop {
            if self.client.should_stop() {
                break;
            }

            // Step 9: apply any resizes observed since the last frame
            // before anything else touches the canvas this frame.
            for (width, height) in self.client.take_resizes() {
                let windows: Vec<(Id, ObjectType)> = self
                    .windows
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|w| (w.canvas_id, w.object_type))
                    .collect();
                for (canvas_id, object_type) in windows {
                    let req = Request::resize(object_type, canvas_id, width, height, 1);
                    if let Err(e) = self.renderer.request(&req) {
                        self.handle_error(e)?;
                    }
                }
            }

            // Steps 1-2: client produces FRAME, user on_frame callbacks
            // (registered directly on `self.client()`) run and may grow
            // the shared requester's batch.
            self.client.step();

            // Step 3: copy the batch, clear the original.
            let maybe_batch = self.requester.lock().unwrap().flush();

            // Step 4: route every request in the copy to the renderer.
            if let Some(batch) = maybe_batch {
                if let Err(e) = self.renderer.requests(batch.requests()) {
                    self.handle_error(e)?;
                }
            }
            self.renderer.process_deletions();

            // Steps 5-8, per window, with the GUI hook spliced in
            // between 6 (recorder refill) and 7 (submit): here that's
            // "run it immediately before render_canvas's own
            // acquire/record/submit/present sequence", since the hook
            // has no real ImGui render pass to splice into yet.
            let windows: Vec<(Id, bool)> = self
                .windows
                .lock()
                .unwrap()
                .iter()
                .map(|w| (w.canvas_id, w.gui_callback.is_some()))
                .collect();

            for (canvas_id, has_gui) in windows {
                if has_gui {
                    self.run_gui_hook(canvas_id);
                }

                if let Err(e) = self.renderer.render_canvas(canvas_id) {
                    self.handle_error(e)?;
                }

                if let Some(path) = &self.capture_path {
                    if let Err(e) = self.renderer.capture_canvas_png(canvas_id, path) {
                        self.handle_error(e)?;
                    }
                }
            }

            frame_no += 1;
            if n_frames != 0 && frame_no >= n_frames {
                break;
            }
        }

        self.client.emit(crate::client::ClientEvent::Destroy);
        Ok(())
    }

    fn run_gui_hook(&self, canvas_id: Id) {
        let windows = self.windows.lock().unwrap();
        if let Some(entry) = windows.iter().find(|w| w.canvas_id == canvas_id) {
            if let Some(cb) = &entry.gui_callback {
                cb(canvas_id);
            }
        }
    }

    /// `app.destroy()`'s second half (5): stop the client, then tear
    /// down the renderer (which waits the queue idle in its own
    /// `Drop`) before the instance drops.
    pub fn stop(&self) {
        self.client.stop();
    }
}
