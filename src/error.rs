//! Error types for sd-bridge.
//!
//! Defines all error codes and types used by the native loader, the engine
//! handle and the pixel codec for consistent error handling and reporting.

use std::fmt;

/// Error codes identifying each failure class.
///
/// These codes let callers programmatically distinguish fatal loader failures
/// from recoverable model-loading failures and programmer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No bundled native module exists for this OS/architecture.
    /// Trigger: unrecognized OS name, 32-bit x86, ARM, etc.
    UnsupportedPlatform,

    /// Extracting the bundled module to disk failed.
    /// Trigger: resource missing from the bundle, disk full, permission denied.
    ExtractionIo,

    /// The dynamic loader rejected the native module.
    /// Trigger: architecture mismatch, corrupt binary, missing symbols.
    LoadFailed,

    /// The native engine refused to construct a context.
    /// Trigger: native allocation failure or invalid auxiliary model paths.
    EngineInitFailed,

    /// An operation was attempted on a closed engine handle.
    /// Trigger: calling generate/load after `close()`.
    HandleClosed,

    /// The native engine reported that loading weights failed.
    /// Trigger: nonexistent or unreadable model file, unsupported format.
    ModelLoadFailed,

    /// An argument was rejected before any native call was made.
    /// Trigger: blank prompt, blank model path, malformed pixel buffer.
    InvalidArgument,

    /// Native generation returned no images or malformed images.
    /// Trigger: engine assertion, out of memory during sampling.
    GenerationFailed,

    /// Reading or writing an image file failed.
    /// Trigger: unknown extension, unreadable file, disk full.
    ImageIo,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedPlatform => "UNSUPPORTED_PLATFORM",
            ErrorCode::ExtractionIo => "EXTRACTION_IO",
            ErrorCode::LoadFailed => "LOAD_FAILED",
            ErrorCode::EngineInitFailed => "ENGINE_INIT_FAILED",
            ErrorCode::HandleClosed => "HANDLE_CLOSED",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::GenerationFailed => "GENERATION_FAILED",
            ErrorCode::ImageIo => "IMAGE_IO",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedPlatform => "No native module is bundled for this platform",
            ErrorCode::ExtractionIo => "Failed to extract the bundled native module",
            ErrorCode::LoadFailed => "The dynamic loader rejected the native module",
            ErrorCode::EngineInitFailed => "The native engine failed to create a context",
            ErrorCode::HandleClosed => "The engine handle has already been closed",
            ErrorCode::ModelLoadFailed => "The native engine failed to load model weights",
            ErrorCode::InvalidArgument => "An argument was rejected before reaching the engine",
            ErrorCode::GenerationFailed => "The native engine failed to generate images",
            ErrorCode::ImageIo => "Failed to read or write an image file",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedPlatform => {
                "Run on x86_64 Linux, macOS or Windows, or install the engine library \
                 on the system library path yourself"
            }
            ErrorCode::ExtractionIo => {
                "Check that the module bundle is complete (SD_BRIDGE_BUNDLE_DIR) and that \
                 the temp directory is writable (SD_BRIDGE_TEMP_DIR)"
            }
            ErrorCode::LoadFailed => {
                "Verify the bundled library matches this CPU architecture and is not corrupted"
            }
            ErrorCode::EngineInitFailed => {
                "Check available memory and the auxiliary model paths (taesd, esrgan, lora)"
            }
            ErrorCode::HandleClosed => "Create a new engine handle; closed handles cannot be reused",
            ErrorCode::ModelLoadFailed => {
                "Verify the model path points to a readable .ckpt, .safetensors or .gguf file \
                 and retry with a corrected path"
            }
            ErrorCode::InvalidArgument => "Provide a non-blank prompt and model path",
            ErrorCode::GenerationFailed => {
                "Try a smaller width/height or batch count, or check system memory"
            }
            ErrorCode::ImageIo => "Use a .png or .jpg path in a writable directory",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of a failed weight-loading call, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLoadAttempt {
    pub model_path: String,
    pub vae_path: String,
    pub weight_type: i32,
    pub schedule: i32,
}

impl fmt::Display for ModelLoadAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model_path: [{}] vae_path: [{}] weight_type: [{}] schedule: [{}]",
            self.model_path, self.vae_path, self.weight_type, self.schedule
        )
    }
}

/// Main error type for bridge operations.
#[derive(Debug)]
pub struct SdError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Parameters of the failed call for `ModelLoadFailed`.
    pub attempt: Option<ModelLoadAttempt>,
}

impl SdError {
    /// Creates a new SdError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            attempt: None,
        }
    }

    /// Creates a new SdError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
            attempt: None,
        }
    }

    /// Creates an UNSUPPORTED_PLATFORM error.
    pub fn unsupported_platform(what: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UnsupportedPlatform,
            format!("Unsupported platform: {}", what.into()),
        )
    }

    /// Creates an EXTRACTION_IO error.
    pub fn extraction_io(reason: impl Into<String>, source: std::io::Error) -> Self {
        Self::with_source(
            ErrorCode::ExtractionIo,
            format!("Failed to extract native module: {}", reason.into()),
            source,
        )
    }

    /// Creates a LOAD_FAILED error.
    pub fn load_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::LoadFailed,
            format!("Failed to load native module: {}", reason.into()),
        )
    }

    /// Creates an ENGINE_INIT_FAILED error.
    pub fn engine_init_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::EngineInitFailed,
            format!("Failed to create engine context: {}", reason.into()),
        )
    }

    /// Creates a HANDLE_CLOSED error naming the rejected operation.
    pub fn handle_closed(operation: &str) -> Self {
        Self::new(
            ErrorCode::HandleClosed,
            format!("Cannot call {} on a closed engine handle", operation),
        )
    }

    /// Creates a MODEL_LOAD_FAILED error carrying the attempted parameters.
    pub fn model_load_failed(attempt: ModelLoadAttempt) -> Self {
        Self {
            code: ErrorCode::ModelLoadFailed,
            message: format!("Load model failed! {}", attempt),
            source: None,
            attempt: Some(attempt),
        }
    }

    /// Creates an INVALID_ARGUMENT error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, reason)
    }

    /// Creates an INVALID_ARGUMENT error for a blank required string.
    pub fn blank_argument(name: &str) -> Self {
        Self::invalid_argument(format!("Argument {} can not be empty/blank", name))
    }

    /// Creates a GENERATION_FAILED error.
    pub fn generation_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::GenerationFailed,
            format!("Generation failed: {}", reason.into()),
        )
    }

    /// Creates an IMAGE_IO error.
    pub fn image_io(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::with_source(ErrorCode::ImageIo, reason, source)
    }

    /// Returns the attempted parameters of a failed weight load.
    pub fn model_load_attempt(&self) -> Option<&ModelLoadAttempt> {
        self.attempt.as_ref()
    }

    /// Returns true for failure classes that abort loading for the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::UnsupportedPlatform | ErrorCode::ExtractionIo | ErrorCode::LoadFailed
        )
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}. Recovery: {}",
            self.code,
            self.message,
            self.code.recovery_hint()
        )
    }
}

impl std::error::Error for SdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type alias using SdError.
pub type Result<T> = std::result::Result<T, SdError>;
