use crate::blend::BlendMode;
use crate::canvas::{Bgra, ChannelLayout, PixelBuffer};
use crate::error::CompositeResult;

/// One named raster in the stack, plus the metadata the compositor reads.
///
/// Fields are private so every write goes through a setter; the owning
/// [`LayerStack`](crate::layer_stack::LayerStack) marks itself dirty whenever
/// it hands out mutable access.
#[derive(Clone, Debug)]
pub struct Layer {
    name: String,
    image: PixelBuffer,
    visible: bool,
    opacity: f32,
    blend_mode: BlendMode,
    /// Visible output is masked by the alpha of the nearest non-clipping
    /// layer below.
    clipping_mask: bool,
}

impl Layer {
    pub fn new(name: impl Into<String>, image: PixelBuffer) -> Self {
        Self {
            name: name.into(),
            image,
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            clipping_mask: false,
        }
    }

    /// Fully transparent layer.
    pub fn blank(name: impl Into<String>, width: u32, height: u32) -> CompositeResult<Self> {
        Ok(Self::new(name, PixelBuffer::create_blank(width, height)?))
    }

    pub fn filled(name: impl Into<String>, width: u32, height: u32, color: Bgra) -> CompositeResult<Self> {
        Ok(Self::new(name, PixelBuffer::new_filled(width, height, color)?))
    }

    /// Build from raw bytes; 3-channel input is promoted to opaque BGRA.
    pub fn from_raw(
        name: impl Into<String>,
        width: u32,
        height: u32,
        layout: ChannelLayout,
        data: &[u8],
    ) -> CompositeResult<Self> {
        Ok(Self::new(name, PixelBuffer::from_raw(width, height, layout, data)?))
    }

    // ---- image --------------------------------------------------------------

    pub fn image(&self) -> &PixelBuffer {
        &self.image
    }

    /// Replace the pixel buffer wholesale.
    pub fn set_image(&mut self, image: PixelBuffer) {
        self.image = image;
    }

    /// Replace the pixel buffer from raw bytes (BGR input gains full alpha).
    pub fn set_image_raw(
        &mut self,
        width: u32,
        height: u32,
        layout: ChannelLayout,
        data: &[u8],
    ) -> CompositeResult<()> {
        self.image = PixelBuffer::from_raw(width, height, layout, data)?;
        Ok(())
    }

    // ---- metadata -----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    /// Clamped to [0, 1]; NaN counts as fully transparent.
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        self.blend_mode = mode;
    }

    pub fn clipping_mask(&self) -> bool {
        self.clipping_mask
    }

    /// Raw flag write. The stack-level setter is the one that refuses the
    /// bottom layer; the compositor tolerates a stray flag at index 0.
    pub fn set_clipping_mask(&mut self, clipping: bool) {
        self.clipping_mask = clipping;
    }

    /// Builder form of the metadata setters, handy when assembling stacks.
    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.set_opacity(opacity);
        self
    }

    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn with_clipping_mask(mut self, clipping: bool) -> Self {
        self.clipping_mask = clipping;
        self
    }

    /// Opacity contribution as the compositor sees it.
    pub(crate) fn contributes(&self) -> bool {
        self.visible && self.opacity > 0.0
    }
}

// ============================================================================
// LAYER STATE — deep-copied snapshot for undo/redo
// ============================================================================

/// Full copy of one layer's metadata and pixels. Holding a `LayerState`
/// never aliases the live buffer, so later edits cannot corrupt history.
#[derive(Clone, Debug)]
pub struct LayerState {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub clipping_mask: bool,
    pub pixels: PixelBuffer,
}

impl LayerState {
    pub fn capture(layer: &Layer) -> Self {
        Self {
            name: layer.name.clone(),
            visible: layer.visible,
            opacity: layer.opacity,
            blend_mode: layer.blend_mode,
            clipping_mask: layer.clipping_mask,
            pixels: layer.image.clone(),
        }
    }

    /// Rebuild a live layer from the snapshot (the snapshot stays intact).
    pub fn restore(&self) -> Layer {
        let mut layer = Layer::new(self.name.clone(), self.pixels.clone());
        layer.visible = self.visible;
        layer.set_opacity(self.opacity);
        layer.blend_mode = self.blend_mode;
        layer.clipping_mask = self.clipping_mask;
        layer
    }

    pub fn memory_bytes(&self) -> usize {
        self.pixels.memory_bytes() + self.name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompositeError;

    #[test]
    fn new_layer_defaults() {
        let layer = Layer::blank("Layer 1", 4, 4).unwrap();
        assert!(layer.visible());
        assert_eq!(layer.opacity(), 1.0);
        assert_eq!(layer.blend_mode(), BlendMode::Normal);
        assert!(!layer.clipping_mask());
        assert!(layer.image().is_fully_transparent());
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(matches!(
            Layer::from_raw("bad", 0, 0, ChannelLayout::Bgra, &[]),
            Err(CompositeError::InvalidImage(_))
        ));
    }

    #[test]
    fn opacity_is_clamped() {
        let mut layer = Layer::blank("l", 1, 1).unwrap();
        layer.set_opacity(1.7);
        assert_eq!(layer.opacity(), 1.0);
        layer.set_opacity(-0.2);
        assert_eq!(layer.opacity(), 0.0);
        layer.set_opacity(f32::NAN);
        assert_eq!(layer.opacity(), 0.0);
    }

    #[test]
    fn set_image_raw_promotes_bgr() {
        let mut layer = Layer::blank("l", 1, 1).unwrap();
        layer.set_image_raw(1, 1, ChannelLayout::Bgr, &[1, 2, 3]).unwrap();
        assert_eq!(layer.image().pixel(0, 0), [1, 2, 3, 255]);
    }

    #[test]
    fn snapshot_is_independent_of_live_layer() {
        let mut layer = Layer::filled("paint", 2, 2, [0, 0, 255, 255])
            .unwrap()
            .with_opacity(0.4)
            .with_blend_mode(BlendMode::Screen);
        let snap = LayerState::capture(&layer);

        let mut edited = layer.image().clone();
        edited.put_pixel(0, 0, [9, 9, 9, 9]);
        layer.set_image(edited);
        layer.set_opacity(1.0);

        assert_eq!(snap.pixels.pixel(0, 0), [0, 0, 255, 255]);
        let restored = snap.restore();
        assert_eq!(restored.opacity(), 0.4);
        assert_eq!(restored.blend_mode(), BlendMode::Screen);
        assert_eq!(restored.image().pixel(0, 0), [0, 0, 255, 255]);
    }
}
