// =============================================================================
// STIMULUS RENDER GRAPH - Demo
// =============================================================================
//
// Drives a two-operation render graph in a window:
//
//   pattern (RenderOperation) ──writes──> "pattern" image
//   present (RenderOperation) ──samples── "pattern" image ──writes──> swapchain
//
// The graph pre-records one command buffer per swapchain image. Every frame
// only the uniform contents change: the pattern's `time` and `resolution`.
//
// FRAME FLOW:
// 1. Acquire swapchain image (index = graph frame)
// 2. Wait for the slot's fence and for whoever last used that image
// 3. Write uniforms through UniformView, flush that frame
// 4. Submit the pre-recorded buffer, present
//
// Resize and shader edits both end in the same place: wait idle, rebuild or
// re-bind, recompile the graph.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use stimulus_render::backend::{self, shader, AcquireStatus, FrameSync, PresentStatus, Swapchain, VulkanDevice};
use stimulus_render::config::Config;
use stimulus_render::graph::ops::RenderOperation;
use stimulus_render::graph::{ImageDesc, OperationId, RenderGraph};
use stimulus_render::shader_watch::ShaderWatcher;
use stimulus_render::ShaderStage;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting render graph demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Render Graph Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SCENE
// =============================================================================

/// The demo graph and the handles the frame loop writes uniforms through.
struct Scene {
    graph: RenderGraph,
    pattern: OperationId,
    present: OperationId,
}

impl Scene {
    /// Load SPIR-V from the shader directory and wire up the graph.
    fn load(config: &Config) -> Result<Self> {
        let vertex = shader::load_spirv(config.shader_path("fullscreen.vert.spv"))?;
        let pattern_frag = shader::load_spirv(config.shader_path("pattern.frag.spv"))?;
        let present_frag = shader::load_spirv(config.shader_path("present.frag.spv"))?;

        let mut graph = RenderGraph::new(config.graphics.frames_in_flight as usize);

        let image = graph.add_image(
            "pattern",
            ImageDesc::new(
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            )
            .with_initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        let backbuffer = graph.add_swapchain_image("backbuffer");

        let pattern = graph.add_operation(RenderOperation::new("pattern", vertex.clone(), pattern_frag)?);
        let present = graph.add_operation(
            RenderOperation::new("present", vertex, present_frag)?.with_clear(config.graphics.clear_color),
        );

        graph.write(pattern, image)?;
        graph.read(present, image)?;
        graph.write(present, backbuffer)?;

        Ok(Self { graph, pattern, present })
    }

    /// Bind the swapchain and re-record every command buffer.
    fn compile(&mut self, device: &Arc<VulkanDevice>, swapchain: &Swapchain) -> Result<()> {
        self.graph.bind_surface(swapchain.surface_info());

        // Push constants are recorded into the command buffers
        self.graph
            .uniform(self.present, ShaderStage::Fragment, "Present")
            .field("vignette")
            .write(&1.0f32);

        self.graph.compile(device)?;
        log::debug!("Schedule:\n{}", self.graph.describe());
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Main application struct holding all Vulkan resources.
///
/// Teardown happens in `Drop` in reverse order of creation.
pub struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW & SURFACE
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    surface: Option<vk::SurfaceKHR>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    device: Option<Arc<VulkanDevice>>,
    swapchain: Option<Swapchain>,
    scene: Option<Scene>,
    watcher: Option<ShaderWatcher>,

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────
    /// One per acquire slot
    frame_sync: Vec<FrameSync>,
    /// Fence of the submission that last used each swapchain image
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
    wait_stages: [vk::PipelineStageFlags; 1],

    // ─────────────────────────────────────────────────────────────────────────
    // STATE FLAGS
    // ─────────────────────────────────────────────────────────────────────────
    needs_resize: bool,
    is_minimized: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // TIMING
    // ─────────────────────────────────────────────────────────────────────────
    start: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            surface: None,
            is_fullscreen,
            device: None,
            swapchain: None,
            scene: None,
            watcher: None,
            frame_sync: Vec::new(),
            images_in_flight: Vec::new(),
            current_frame: 0,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            needs_resize: false,
            is_minimized: false,
            start: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let extensions = backend::surface::required_extensions(window.as_ref())?;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, &extensions)?;

        let surface = backend::surface::create_surface(&device, window.as_ref())?;
        self.device = Some(device.clone());
        self.surface = Some(surface);

        let slots = self.config.graphics.frames_in_flight.max(1) as usize;
        self.frame_sync = (0..slots).map(|_| FrameSync::new(&device)).collect::<Result<Vec<_>>>()?;

        self.scene = Some(Scene::load(&self.config).context("Failed to build render graph")?);
        self.create_swapchain_resources(&window)?;

        if self.config.shaders.hot_reload {
            match ShaderWatcher::new(&self.config.shaders.directory) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {:#}", e),
            }
        }

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    /// Create the swapchain and recompile the graph against it.
    ///
    /// Called again whenever the window is resized.
    fn create_swapchain_resources(&mut self, window: &Window) -> Result<()> {
        let device = self.device.clone().context("Device not initialized")?;
        let surface = self.surface.context("Surface not initialized")?;
        let scene = self.scene.as_mut().context("Render graph not built")?;

        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;

        // The graph's framebuffers point at the old swapchain's views
        scene.graph.release();
        self.swapchain = None;

        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            size.width,
            size.height,
            self.config.get_present_mode(),
            self.config.graphics.frames_in_flight,
        )?;

        scene.compile(&device, &swapchain)?;

        self.images_in_flight = vec![vk::Fence::null(); swapchain.image_count()];
        self.swapchain = Some(swapchain);
        self.needs_resize = false;
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        if let Some(ref device) = self.device {
            device.wait_idle()?;
        }

        let window = self.window.clone();
        if let Some(ref win) = window {
            self.create_swapchain_resources(win)?;
        }
        Ok(())
    }

    /// Rebuild the graph when compiled shaders change on disk. A shader that
    /// fails to load or reflect keeps the current graph running.
    fn reload_shaders(&mut self) -> Result<()> {
        let Some(watcher) = &self.watcher else {
            return Ok(());
        };
        let changed = watcher.poll();
        if changed.is_empty() {
            return Ok(());
        }
        for path in &changed {
            log::info!("Shader changed: {:?}", path);
        }

        let mut scene = match Scene::load(&self.config) {
            Ok(scene) => scene,
            Err(e) => {
                log::warn!("Keeping previous shaders: {:#}", e);
                return Ok(());
            }
        };

        let device = self.device.clone().context("Device not initialized")?;
        device.wait_idle()?;
        self.scene = None;

        if let Some(swapchain) = &self.swapchain {
            scene.compile(&device, swapchain)?;
        }
        self.scene = Some(scene);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame. Returns whether a frame was submitted.
    pub fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }

        if self.needs_resize {
            self.recreate_swapchain()?;
            if self.is_minimized {
                return Ok(false);
            }
        }

        self.reload_shaders()?;

        let device = self.device.clone().context("Device not initialized")?;
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let scene = self.scene.as_mut().context("Render graph not built")?;
        let sync = &self.frame_sync[self.current_frame];

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Acquire; the image index is the graph's frame index
        // ─────────────────────────────────────────────────────────────────────
        let image_index = match swapchain.acquire_next_image(u64::MAX, sync.image_available)? {
            AcquireStatus::Ready(index, suboptimal) => {
                if suboptimal {
                    self.needs_resize = true;
                }
                index
            }
            AcquireStatus::NeedsRecreate => {
                self.needs_resize = true;
                return Ok(false);
            }
        };
        let frame = image_index as usize;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Wait until this slot and this image are free
        // ─────────────────────────────────────────────────────────────────────
        sync.wait(&device)?;
        let image_fence = self.images_in_flight[frame];
        if image_fence != vk::Fence::null() && image_fence != sync.in_flight_fence {
            unsafe { device.device.wait_for_fences(&[image_fence], true, u64::MAX)? };
        }
        self.images_in_flight[frame] = sync.in_flight_fence;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Uniforms
        // ─────────────────────────────────────────────────────────────────────
        let time = self.start.elapsed().as_secs_f32();
        let resolution = glam::Vec2::new(swapchain.extent.width as f32, swapchain.extent.height as f32);
        {
            let mut params = scene.graph.uniform(scene.pattern, ShaderStage::Fragment, "Params");
            params.field("time").write(&time);
            params.field("resolution").write(&resolution);
        }
        scene.graph.flush(frame)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Submit and present
        // ─────────────────────────────────────────────────────────────────────
        scene.graph.submit(
            frame,
            &[sync.image_available],
            &self.wait_stages,
            &[sync.render_finished],
            sync.in_flight_fence,
        )?;

        match scene.graph.present(swapchain, image_index, &[sync.render_finished])? {
            PresentStatus::Ok => {}
            PresentStatus::NeedsRecreate => self.needs_resize = true,
        }

        self.current_frame = (self.current_frame + 1) % self.frame_sync.len();
        Ok(true)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        self.window = Some(window.clone());

        if let Err(e) = self.init_vulkan(window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(device) = self.device.clone() {
            let _ = device.wait_idle();

            // Graph first: its framebuffers reference swapchain views
            self.scene = None;
            self.swapchain = None;

            for sync in &self.frame_sync {
                sync.destroy(&device);
            }

            if let Some(surface) = self.surface.take() {
                let loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
                unsafe { loader.destroy_surface(surface, None) };
            }
        }

        log::info!("Cleanup complete");
    }
}
