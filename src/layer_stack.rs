// ============================================================================
// LAYER STACK — ordered layers, active index, cached composite
// ============================================================================
//
// Index 0 is the bottom layer. The stack owns an explicit dirty bit: every
// mutation sets it, and `get_composite()` is the only path that clears it.

use std::borrow::Cow;
use std::sync::Arc;

use crate::blend::BlendMode;
use crate::canvas::{PixelBuffer, ResampleFilter};
use crate::compositor::{Compositor, resolve_clip_base};
use crate::error::{CompositeError, CompositeResult};
use crate::layer::{Layer, LayerState};
use crate::settings::CompositorSettings;

#[derive(Debug)]
pub struct LayerStack {
    layers: Vec<Layer>,
    active_index: usize,
    width: u32,
    height: u32,
    dirty: bool,
    /// Shared read-only with display code; replaced, never mutated.
    composite_cache: Option<Arc<PixelBuffer>>,
    compositor: Compositor,
}

impl LayerStack {
    /// New document: a single opaque white "Background" layer.
    pub fn new(width: u32, height: u32) -> CompositeResult<Self> {
        let background = Layer::filled("Background", width, height, [255, 255, 255, 255])?;
        Self::from_layers(vec![background])
    }

    /// Wrap an existing layer list. The canvas takes the bottom layer's size.
    pub fn from_layers(layers: Vec<Layer>) -> CompositeResult<Self> {
        let bottom = layers.first().ok_or_else(|| {
            CompositeError::InvalidCompositeState("a layer stack needs at least one layer".into())
        })?;
        let (width, height) = bottom.image().dimensions();
        Ok(Self {
            active_index: layers.len() - 1,
            layers,
            width,
            height,
            dirty: true,
            composite_cache: None,
            compositor: Compositor::default(),
        })
    }

    pub fn with_settings(mut self, settings: CompositorSettings) -> Self {
        self.set_settings(settings);
        self
    }

    pub fn settings(&self) -> &CompositorSettings {
        self.compositor.settings()
    }

    pub fn set_settings(&mut self, settings: CompositorSettings) {
        self.compositor.set_settings(settings);
        self.mark_dirty();
    }

    // ---- accessors ----------------------------------------------------------

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always false.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    fn check_index(&self, index: usize) -> CompositeResult<()> {
        if index < self.layers.len() {
            Ok(())
        } else {
            crate::log_warn!(
                "Rejected layer index {} (stack has {} layers)",
                index,
                self.layers.len()
            );
            Err(CompositeError::IndexOutOfRange { index, len: self.layers.len() })
        }
    }

    pub fn layer(&self, index: usize) -> CompositeResult<&Layer> {
        self.check_index(index)?;
        Ok(&self.layers[index])
    }

    /// Mutable access for tools. The composite is treated as stale from here on.
    pub fn layer_mut(&mut self, index: usize) -> CompositeResult<&mut Layer> {
        self.check_index(index)?;
        self.mark_dirty();
        Ok(&mut self.layers[index])
    }

    pub fn active_layer(&self) -> &Layer {
        &self.layers[self.active_index]
    }

    /// The layer that receives edits; marks the composite stale.
    pub fn active_layer_mut(&mut self) -> &mut Layer {
        self.mark_dirty();
        &mut self.layers[self.active_index]
    }

    pub fn set_active_index(&mut self, index: usize) -> CompositeResult<()> {
        self.check_index(index)?;
        self.active_index = index;
        Ok(())
    }

    // ---- dirty bit / cache --------------------------------------------------

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Opaque composite of the whole stack, recomputed only when dirty.
    pub fn get_composite(&mut self) -> CompositeResult<Arc<PixelBuffer>> {
        if !self.dirty
            && let Some(cached) = &self.composite_cache
        {
            return Ok(Arc::clone(cached));
        }
        let composite = Arc::new(
            self.compositor
                .compose_layers_to(&self.layers, self.width, self.height)?,
        );
        self.composite_cache = Some(Arc::clone(&composite));
        self.dirty = false;
        Ok(composite)
    }

    // ---- metadata setters ---------------------------------------------------

    pub fn set_opacity(&mut self, index: usize, opacity: f32) -> CompositeResult<()> {
        self.layer_mut(index)?.set_opacity(opacity);
        Ok(())
    }

    pub fn set_visible(&mut self, index: usize, visible: bool) -> CompositeResult<()> {
        self.layer_mut(index)?.set_visible(visible);
        Ok(())
    }

    /// Flip visibility, returning the new state.
    pub fn toggle_visibility(&mut self, index: usize) -> CompositeResult<bool> {
        let layer = self.layer_mut(index)?;
        let visible = !layer.visible();
        layer.set_visible(visible);
        Ok(visible)
    }

    pub fn set_blend_mode(&mut self, index: usize, mode: BlendMode) -> CompositeResult<()> {
        self.layer_mut(index)?.set_blend_mode(mode);
        Ok(())
    }

    /// The bottom layer has nothing to clip to, so enabling it there is rejected.
    pub fn set_clipping_mask(&mut self, index: usize, clipping: bool) -> CompositeResult<()> {
        self.check_index(index)?;
        if index == 0 && clipping {
            crate::log_warn!("Rejected clipping mask on the bottom layer");
            return Err(CompositeError::ClippingOnBottomLayer);
        }
        self.layer_mut(index)?.set_clipping_mask(clipping);
        Ok(())
    }

    /// Renaming does not affect pixels, so the cache stays valid.
    pub fn rename(&mut self, index: usize, name: impl Into<String>) -> CompositeResult<()> {
        self.check_index(index)?;
        self.layers[index].set_name(name);
        Ok(())
    }

    pub fn set_layer_image(&mut self, index: usize, image: PixelBuffer) -> CompositeResult<()> {
        self.layer_mut(index)?.set_image(image);
        Ok(())
    }

    // ---- structural operations ----------------------------------------------

    /// Insert `layer` at `at_index` (clamped to the top). The active index
    /// keeps pointing at the same layer it did before. Returns the index used.
    pub fn insert(&mut self, layer: Layer, at_index: usize) -> usize {
        let idx = at_index.min(self.layers.len());
        crate::log_info!("Insert layer '{}' at {}", layer.name(), idx);
        self.layers.insert(idx, layer);
        if self.active_index >= idx && self.layers.len() > 1 {
            self.active_index += 1;
        }
        self.mark_dirty();
        idx
    }

    /// Add a new transparent layer above the active layer and make it active.
    pub fn add_layer(&mut self) -> CompositeResult<usize> {
        let name = format!("Layer {}", self.layers.len() + 1);
        let layer = Layer::blank(name, self.width, self.height)?;
        let idx = self.insert(layer, self.active_index + 1);
        self.active_index = idx;
        Ok(idx)
    }

    /// Duplicate the layer at `index` directly above it; the copy becomes active.
    pub fn duplicate(&mut self, index: usize) -> CompositeResult<usize> {
        self.check_index(index)?;
        let mut copy = self.layers[index].clone();
        copy.set_name(format!("{} copy", self.layers[index].name()));
        let idx = self.insert(copy, index + 1);
        self.active_index = idx;
        Ok(idx)
    }

    /// Remove the layer at `index`, returning it. The last layer cannot go.
    pub fn delete(&mut self, index: usize) -> CompositeResult<Layer> {
        if self.layers.len() <= 1 {
            crate::log_warn!("Rejected delete of the last remaining layer");
            return Err(CompositeError::CannotDeleteLastLayer);
        }
        self.check_index(index)?;
        let removed = self.layers.remove(index);

        if self.active_index >= self.layers.len() {
            self.active_index = self.layers.len() - 1;
        } else if self.active_index > index {
            self.active_index -= 1;
        }
        crate::log_info!("Deleted layer '{}' at {}", removed.name(), index);
        self.mark_dirty();
        Ok(removed)
    }

    /// Move a layer. Clip bases are recomputed on the next composite, so a
    /// clipping layer moved elsewhere simply clips to its new neighbour.
    pub fn reorder(&mut self, from_index: usize, to_index: usize) -> CompositeResult<()> {
        self.check_index(from_index)?;
        self.check_index(to_index)?;
        if from_index == to_index {
            return Ok(());
        }

        let layer = self.layers.remove(from_index);
        self.layers.insert(to_index, layer);

        if self.active_index == from_index {
            self.active_index = to_index;
        } else if from_index < self.active_index && to_index >= self.active_index {
            self.active_index -= 1;
        } else if from_index > self.active_index && to_index <= self.active_index {
            self.active_index += 1;
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn move_up(&mut self, index: usize) -> CompositeResult<()> {
        self.reorder(index, index + 1)
    }

    pub fn move_down(&mut self, index: usize) -> CompositeResult<()> {
        if index == 0 {
            return Err(CompositeError::NoLayerBelow);
        }
        self.reorder(index, index - 1)
    }

    /// Pixels of layer `index` as they should land on the layer below.
    ///
    /// A clipping layer whose clip base is directly below only shows where
    /// that base is opaque, so its alpha is gated by the base's alpha first.
    fn merge_source(&self, index: usize) -> CompositeResult<Cow<'_, PixelBuffer>> {
        let top = &self.layers[index];
        let below = &self.layers[index - 1];
        if !top.clipping_mask() || resolve_clip_base(&self.layers, index) != Some(index - 1) {
            return Ok(Cow::Borrowed(top.image()));
        }

        let (w, h) = below.image().dimensions();
        let mut gated = top
            .image()
            .resize_to(w, h, self.compositor.settings().resample_filter)?;
        for (px, base) in gated
            .as_raw_mut()
            .chunks_exact_mut(4)
            .zip(below.image().as_raw().chunks_exact(4))
        {
            px[3] = ((px[3] as u32 * base[3] as u32 + 127) / 255) as u8;
        }
        Ok(Cow::Owned(gated))
    }

    /// Paint layer `index` onto layer `index - 1`; returns whether anything
    /// was painted (hidden layers contribute nothing).
    fn paint_down(&mut self, index: usize) -> CompositeResult<bool> {
        self.check_index(index)?;
        if index == 0 {
            crate::log_warn!("Rejected merge of the bottom layer");
            return Err(CompositeError::NoLayerBelow);
        }
        let top = &self.layers[index];
        if !top.visible() {
            return Ok(false);
        }
        let (opacity, mode) = (top.opacity(), top.blend_mode());
        let merged = {
            let source = self.merge_source(index)?;
            self.compositor.merge_two_layers(
                self.layers[index - 1].image(),
                &source,
                opacity,
                mode,
            )?
        };
        self.layers[index - 1].set_image(merged);
        Ok(true)
    }

    /// Merge layer `index` into the layer below and remove it.
    pub fn merge_down(&mut self, index: usize) -> CompositeResult<()> {
        let painted = self.paint_down(index)?;
        let removed = self.layers.remove(index);
        if self.active_index >= index {
            self.active_index -= 1;
        }
        crate::log_info!(
            "Merged layer '{}' down into '{}'{}",
            removed.name(),
            self.layers[index - 1].name(),
            if painted { "" } else { " (hidden, discarded)" }
        );
        self.mark_dirty();
        Ok(())
    }

    /// Merge layer `index` into the layer below, then clear it to transparent.
    /// The layer count is unchanged.
    pub fn write_down(&mut self, index: usize) -> CompositeResult<()> {
        self.paint_down(index)?;
        let (w, h) = self.layers[index].image().dimensions();
        self.layers[index].set_image(PixelBuffer::create_blank(w, h)?);
        crate::log_info!("Wrote layer {} down into {}", index, index - 1);
        self.mark_dirty();
        Ok(())
    }

    /// Flatten every visible layer into a single "Background" layer.
    pub fn merge_all(&mut self) -> CompositeResult<()> {
        let flat = self.compositor.flatten_layers(&self.layers, self.width, self.height)?;
        crate::log_info!("Flattened {} layers", self.layers.len());
        self.layers = vec![Layer::new("Background", flat)];
        self.active_index = 0;
        self.mark_dirty();
        Ok(())
    }

    /// Flatten the visible layers into one "Merged" layer placed where the
    /// bottom-most visible layer was. Hidden layers are kept in order.
    /// Returns false (and changes nothing) when no layer is visible.
    pub fn merge_all_visible(&mut self) -> CompositeResult<bool> {
        let Some(first_visible) = self.layers.iter().position(|l| l.visible()) else {
            return Ok(false);
        };
        let flat = self.compositor.flatten_layers(&self.layers, self.width, self.height)?;
        let mut merged = Some(Layer::new("Merged", flat));
        let mut kept = Vec::with_capacity(self.layers.len());
        let mut merged_index = 0;

        for (i, layer) in std::mem::take(&mut self.layers).into_iter().enumerate() {
            if !layer.visible() {
                kept.push(layer);
            } else if i == first_visible
                && let Some(m) = merged.take()
            {
                merged_index = kept.len();
                kept.push(m);
            }
        }

        crate::log_info!(
            "Merged visible layers into index {} ({} layers remain)",
            merged_index,
            kept.len()
        );
        self.layers = kept;
        self.active_index = merged_index;
        self.mark_dirty();
        Ok(true)
    }

    /// Resample every layer to a new canvas size.
    pub fn scale_canvas(&mut self, width: u32, height: u32, filter: ResampleFilter) -> CompositeResult<()> {
        let resized = self
            .layers
            .iter()
            .map(|l| l.image().resize_to(width, height, filter))
            .collect::<CompositeResult<Vec<_>>>()?;
        for (layer, image) in self.layers.iter_mut().zip(resized) {
            layer.set_image(image);
        }
        self.width = width;
        self.height = height;
        self.mark_dirty();
        Ok(())
    }

    // ---- undo snapshots -----------------------------------------------------

    /// Deep copy of every layer, bottom to top.
    pub fn backup_all_layers(&self) -> Vec<LayerState> {
        self.layers.iter().map(LayerState::capture).collect()
    }

    /// Swap in layers rebuilt from a snapshot. The canvas takes the bottom
    /// layer's size; `active_index` is clamped into range.
    pub fn replace_all(&mut self, states: &[LayerState], active_index: usize) -> CompositeResult<()> {
        if states.is_empty() {
            return Err(CompositeError::InvalidCompositeState(
                "cannot restore an empty layer snapshot".into(),
            ));
        }
        self.layers = states.iter().map(LayerState::restore).collect();
        let (w, h) = self.layers[0].image().dimensions();
        self.width = w;
        self.height = h;
        self.active_index = active_index.min(self.layers.len() - 1);
        self.composite_cache = None;
        self.mark_dirty();
        Ok(())
    }

    /// Bytes of pixel data held by all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.image().memory_bytes()).sum()
    }
}
