use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub zoom: ZoomConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    /// Name of the camera worker thread
    #[serde(default = "default_camera_worker_name")]
    pub camera_thread_name: String,

    /// Name of the UI worker thread
    #[serde(default = "default_ui_worker_name")]
    pub ui_thread_name: String,

    /// Timeout for joining a released worker thread, in milliseconds
    #[serde(default = "default_release_join_ms")]
    pub release_join_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// How long a capture request issued mid-capture stays eligible for
    /// replay once the in-flight capture completes, in milliseconds
    #[serde(default = "default_pending_grace_ms")]
    pub pending_grace_ms: u64,

    /// Bounded wait for the synchronous stop-preview path, in milliseconds
    #[serde(default = "default_sync_stop_timeout_ms")]
    pub sync_stop_timeout_ms: u64,

    /// Maximum bounded burst length accepted by capture_photo
    #[serde(default = "default_max_burst_frames")]
    pub max_burst_frames: u32,

    /// Delay between the record-start cue and starting the media encoder,
    /// in milliseconds
    #[serde(default = "default_record_start_delay_ms")]
    pub record_start_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FocusConfig {
    /// Maximum number of metering regions accepted per auto-focus request
    #[serde(default = "default_max_regions")]
    pub max_regions: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ZoomConfig {
    /// Minimum zoom ratio
    #[serde(default = "default_zoom_min")]
    pub min_ratio: f32,

    /// Maximum zoom ratio
    #[serde(default = "default_zoom_max")]
    pub max_ratio: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExposureConfig {
    /// Minimum exposure compensation step
    #[serde(default = "default_exposure_min")]
    pub min_compensation: i32,

    /// Maximum exposure compensation step
    #[serde(default = "default_exposure_max")]
    pub max_compensation: i32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UiConfig {
    /// Number of reusable picture buffers kept in the marshalling pool
    #[serde(default = "default_frame_pool_capacity")]
    pub frame_pool_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DemoConfig {
    /// Output directory for demo captures and session summaries
    #[serde(default = "default_demo_output_dir")]
    pub output_dir: String,
}

fn default_camera_worker_name() -> String {
    "camrig-camera".to_string()
}

fn default_ui_worker_name() -> String {
    "camrig-ui".to_string()
}

fn default_release_join_ms() -> u64 {
    3000
}

fn default_pending_grace_ms() -> u64 {
    800
}

fn default_sync_stop_timeout_ms() -> u64 {
    1000
}

fn default_max_burst_frames() -> u32 {
    99
}

fn default_record_start_delay_ms() -> u64 {
    200
}

fn default_max_regions() -> usize {
    4
}

fn default_zoom_min() -> f32 {
    1.0
}

fn default_zoom_max() -> f32 {
    8.0
}

fn default_exposure_min() -> i32 {
    -12
}

fn default_exposure_max() -> i32 {
    12
}

fn default_frame_pool_capacity() -> usize {
    4
}

fn default_demo_output_dir() -> String {
    "./camrig-out".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            camera_thread_name: default_camera_worker_name(),
            ui_thread_name: default_ui_worker_name(),
            release_join_ms: default_release_join_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pending_grace_ms: default_pending_grace_ms(),
            sync_stop_timeout_ms: default_sync_stop_timeout_ms(),
            max_burst_frames: default_max_burst_frames(),
            record_start_delay_ms: default_record_start_delay_ms(),
        }
    }
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            max_regions: default_max_regions(),
        }
    }
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            min_ratio: default_zoom_min(),
            max_ratio: default_zoom_max(),
        }
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            min_compensation: default_exposure_min(),
            max_compensation: default_exposure_max(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            frame_pool_capacity: default_frame_pool_capacity(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            output_dir: default_demo_output_dir(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            capture: CaptureConfig::default(),
            focus: FocusConfig::default(),
            zoom: ZoomConfig::default(),
            exposure: ExposureConfig::default(),
            ui: UiConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camrig.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with CAMRIG_ prefix
            .add_source(Environment::with_prefix("CAMRIG").separator("_"))
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.camera_thread_name.is_empty() || self.worker.ui_thread_name.is_empty() {
            return Err(ConfigError::Message(
                "Worker thread names must not be empty".to_string(),
            ));
        }

        if self.capture.pending_grace_ms == 0 {
            return Err(ConfigError::Message(
                "Pending capture grace window must be greater than 0".to_string(),
            ));
        }

        if self.capture.sync_stop_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Synchronous stop timeout must be greater than 0".to_string(),
            ));
        }

        if self.capture.max_burst_frames < 2 {
            return Err(ConfigError::Message(
                "Maximum burst length must allow at least 2 frames".to_string(),
            ));
        }

        if self.zoom.min_ratio < 1.0 || self.zoom.max_ratio < self.zoom.min_ratio {
            return Err(ConfigError::Message(
                "Zoom ratio range is invalid".to_string(),
            ));
        }

        if self.exposure.min_compensation > self.exposure.max_compensation {
            return Err(ConfigError::Message(
                "Exposure compensation range is invalid".to_string(),
            ));
        }

        if self.ui.frame_pool_capacity == 0 {
            return Err(ConfigError::Message(
                "Frame pool capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
