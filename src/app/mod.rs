use std::sync::Arc;
use std::time::Instant;
use color_eyre::Result;
use color_eyre::eyre::Report;
use glam::Vec4;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use mvr::renderer::{FrameState, RenderConfig, Renderer};

pub struct App {
    // Dropped before the window it presents to
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    // State
    start_time: Instant,
    minimized: bool,
    close_requested: bool,
    error: Option<Report>,
}

impl App {
    pub fn new() -> Self {
        Self {
            renderer: None,
            window: None,

            start_time: Instant::now(),
            minimized: false,
            close_requested: false,
            error: None,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.run_app(&mut self)?;

        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(event_loop.create_window(
            Window::default_attributes().with_title("mvr"),
        )?);
        let size = window.inner_size();
        let config = RenderConfig::default();

        self.renderer = Some(Renderer::new(window.as_ref(), (size.width, size.height), config)?);
        self.window = Some(window);
        Ok(())
    }

    /// Ends the frame recorded last time and records the next one.
    fn draw(&mut self) -> Result<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        if self.minimized {
            return Ok(());
        }

        renderer.present_frame()?;

        let t = self.start_time.elapsed().as_secs_f32();
        let color = Vec4::new(
            0.5 + 0.5 * t.sin(),
            0.5 + 0.5 * (t * 0.7 + 2.0).sin(),
            0.5 + 0.5 * (t * 1.3 + 4.0).sin(),
            1.0,
        );
        // Exercises the temporary upload path, nothing reads it yet
        renderer.create_temp_buffer_from(&[color])?;
        renderer.clear_image(color.to_array())?;

        Ok(())
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        self.minimized = size.width == 0 || size.height == 0;
        if let Some(renderer) = self.renderer.as_mut() {
            if !self.minimized {
                renderer.resize(size.width, size.height);
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(renderer) = self.renderer.as_mut() {
            if renderer.state() == FrameState::Recording {
                renderer.end_frame()?;
            }
        }
        self.renderer = None;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: Report) {
        log::error!("{:?}", error);
        self.error = Some(error);
        self.close_requested = true;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.window.as_ref().map(|window| window.id()) != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::Resized(new_size) => {
                self.resize(new_size);
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw() {
                    self.fail(event_loop, e);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: Key::Named(NamedKey::Escape),
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.close_requested {
            if let Err(e) = self.shutdown() {
                log::error!("{:?}", e);
            }
            event_loop.exit();
        } else if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}
