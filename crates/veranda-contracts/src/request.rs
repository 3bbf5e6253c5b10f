use image::RgbImage;

/// Mesh opacity buckets with reference imagery on file.
pub const SUPPORTED_OPACITIES: [&str; 3] = ["80", "95", "99"];

/// Bucket used when the caller's requested opacity is unsupported or absent.
pub const DEFAULT_OPACITY: &str = "95";

pub const DEFAULT_MESH_TYPE: &str = "lifestyle_environmental";

/// One visualization request. Immutable once created; `id` is used only
/// for event correlation and artifact naming.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: String,
    pub image: RgbImage,
    pub opacity: Option<String>,
    pub color: Option<String>,
    pub mesh_type: String,
}

impl GenerationRequest {
    pub fn new(image: RgbImage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            image,
            opacity: None,
            color: None,
            mesh_type: DEFAULT_MESH_TYPE.to_string(),
        }
    }

    pub fn with_style(mut self, opacity: Option<String>, color: Option<String>) -> Self {
        self.opacity = opacity;
        self.color = color;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// The opacity bucket the pipeline will actually use: the requested one
    /// when it is a supported bucket, the default otherwise.
    pub fn resolved_opacity(&self) -> &str {
        match self.opacity.as_deref() {
            Some(value) if SUPPORTED_OPACITIES.contains(&value) => value,
            _ => DEFAULT_OPACITY,
        }
    }
}

/// Score and pass/fail verdict parsed from a quality-check reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityVerdict {
    pub score: i64,
    pub passed: bool,
}

/// What one pipeline run hands back to the caller: the restored scene, the
/// image actually delivered, and the score attached to it. `attempts` and
/// `warnings` exist for receipts and operator visibility.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub clean_image: RgbImage,
    pub final_image: RgbImage,
    pub quality_score: i64,
    pub attempts: Vec<QualityVerdict>,
    pub warnings: Vec<String>,
}
