use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::blend::BlendMode;
use crate::canvas::PixelBuffer;
use crate::error::CompositeError;
use crate::layer::Layer;
use crate::layer_stack::LayerStack;

// ============================================================================
// ERRORS
// ============================================================================

/// Error type for image and project file operations
#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Image(image::ImageError),
    Serialize(String),
    InvalidFormat(String),
}

impl std::fmt::Display for ProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {}", e),
            ProjectError::Image(e) => write!(f, "Image error: {}", e),
            ProjectError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ProjectError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<image::ImageError> for ProjectError {
    fn from(e: image::ImageError) -> Self {
        ProjectError::Image(e)
    }
}

impl From<Box<bincode::ErrorKind>> for ProjectError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectError::Serialize(e.to_string())
    }
}

impl From<CompositeError> for ProjectError {
    fn from(e: CompositeError) -> Self {
        ProjectError::InvalidFormat(e.to_string())
    }
}

// ============================================================================
// RASTER IMAGES
// ============================================================================

/// Decode any format the `image` crate understands into a BGRA buffer.
pub fn load_image(path: &Path) -> Result<PixelBuffer, ProjectError> {
    let rgba = image::open(path)?.to_rgba8();
    Ok(PixelBuffer::from_rgba_image(&rgba)?)
}

/// Load an image file as a layer named after the file stem.
pub fn load_layer(path: &Path) -> Result<Layer, ProjectError> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Layer".to_string());
    let image = load_image(path)?;
    crate::log_info!(
        "Loaded layer '{}' ({}x{}) from {}",
        name,
        image.width(),
        image.height(),
        path.display()
    );
    Ok(Layer::new(name, image))
}

/// Write a buffer to disk; the format follows the file extension.
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn save_image(buffer: &PixelBuffer, path: &Path) -> Result<(), ProjectError> {
    let rgba = buffer.to_rgba_image();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => DynamicImage::ImageRgba8(rgba).to_rgb8().save(path)?,
        _ => rgba.save(path)?,
    }
    crate::log_info!("Saved {}x{} image to {}", buffer.width(), buffer.height(), path.display());
    Ok(())
}

// ============================================================================
// LFE PROJECT FILE FORMAT
// ============================================================================

/// Magic header for the layered project format
const LFE_MAGIC: &str = "LFE1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
const MAX_LAYERS: usize = 256;

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    magic: String,
    width: u32,
    height: u32,
    active_layer_index: usize,
    layers: Vec<LayerData>,
}

/// Layer metadata plus its raw BGRA pixels. Layers keep their own size,
/// which may differ from the canvas.
#[derive(Serialize, Deserialize)]
struct LayerData {
    name: String,
    visible: bool,
    opacity: f32,
    blend_mode: u8,
    clipping_mask: bool,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

fn build_project(stack: &LayerStack) -> ProjectFile {
    let layers = stack
        .layers()
        .iter()
        .map(|layer| {
            let image = layer.image();
            LayerData {
                name: layer.name().to_string(),
                visible: layer.visible(),
                opacity: layer.opacity(),
                blend_mode: layer.blend_mode().to_u8(),
                clipping_mask: layer.clipping_mask(),
                width: image.width(),
                height: image.height(),
                pixels: image.as_raw().to_vec(),
            }
        })
        .collect();

    ProjectFile {
        magic: LFE_MAGIC.to_string(),
        width: stack.width(),
        height: stack.height(),
        active_layer_index: stack.active_index(),
        layers,
    }
}

fn write_project(project: &ProjectFile, path: &Path) -> Result<(), ProjectError> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, project)?;
    Ok(())
}

/// Save the whole stack (metadata and pixels) as a .lfe project file
pub fn save_project(stack: &LayerStack, path: &Path) -> Result<(), ProjectError> {
    write_project(&build_project(stack), path)?;
    crate::log_info!("Saved project with {} layers to {}", stack.len(), path.display());
    Ok(())
}

/// Load a .lfe project file
pub fn load_project(path: &Path) -> Result<LayerStack, ProjectError> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(ProjectError::InvalidFormat("File too small".into()));
    }

    // bincode encodes a String as: 8-byte length prefix + UTF-8 data,
    // so bytes 8..12 hold the 4-character magic.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != LFE_MAGIC {
        crate::log_warn!("Rejected project {}: unknown magic '{}'", path.display(), magic);
        return Err(ProjectError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }

    let project: ProjectFile = bincode::deserialize(&raw)?;
    let stack = restore_project(project)?;
    crate::log_info!("Loaded project with {} layers from {}", stack.len(), path.display());
    Ok(stack)
}

fn check_dims(what: &str, width: u32, height: u32) -> Result<(), ProjectError> {
    if width == 0 || height == 0 {
        return Err(ProjectError::InvalidFormat(format!(
            "{} dimensions cannot be zero",
            what
        )));
    }
    if width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(ProjectError::InvalidFormat(format!(
            "{} size {}x{} exceeds maximum allowed {}x{}",
            what, width, height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    Ok(())
}

fn restore_project(project: ProjectFile) -> Result<LayerStack, ProjectError> {
    check_dims("Canvas", project.width, project.height)?;
    if project.layers.len() > MAX_LAYERS {
        return Err(ProjectError::InvalidFormat(format!(
            "Project contains {} layers, which exceeds the maximum of {}",
            project.layers.len(),
            MAX_LAYERS
        )));
    }
    if project.layers.is_empty() {
        return Err(ProjectError::InvalidFormat("Project contains no layers".into()));
    }

    let mut layers = Vec::with_capacity(project.layers.len());
    for ld in project.layers {
        check_dims(&format!("Layer '{}'", ld.name), ld.width, ld.height)?;
        let image = PixelBuffer::from_bgra_vec(ld.width, ld.height, ld.pixels)?;
        layers.push(
            Layer::new(ld.name, image)
                .with_visible(ld.visible)
                .with_opacity(ld.opacity)
                .with_blend_mode(BlendMode::from_u8(ld.blend_mode))
                .with_clipping_mask(ld.clipping_mask),
        );
    }

    let mut stack = LayerStack::from_layers(layers)?;
    // The stored canvas size wins over the bottom layer's own size.
    if (stack.width(), stack.height()) != (project.width, project.height) {
        let filter = stack.settings().resample_filter;
        stack.scale_canvas(project.width, project.height, filter)?;
    }
    stack.set_active_index(project.active_layer_index.min(stack.len() - 1))?;
    Ok(stack)
}
