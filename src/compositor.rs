// ============================================================================
// COMPOSITOR — flattens an ordered layer stack into one buffer
// ============================================================================
//
// Two families of output:
//   * compose_layers   — what the user sees: opaque, checkerboard showing
//                        through any remaining transparency.
//   * merge / flatten  — intermediate layers: Porter-Duff "over" with a real
//                        output alpha, un-premultiplied at the end.
//
// Clip bases are resolved live on every call; nothing about the stack's
// structure is cached here.

use std::borrow::Cow;

use rayon::prelude::*;

use crate::blend::BlendMode;
use crate::canvas::{Bgra, CHANNELS, PixelBuffer};
use crate::error::{CompositeError, CompositeResult};
use crate::layer::Layer;
use crate::settings::CompositorSettings;

/// Index of the layer a clipping layer at `index` clips to: the nearest
/// layer below it that is not itself a clipping layer. `None` when the scan
/// runs off the bottom of the stack (or `index` is out of range).
pub fn resolve_clip_base(layers: &[Layer], index: usize) -> Option<usize> {
    if index >= layers.len() {
        return None;
    }
    layers[..index].iter().rposition(|l| !l.clipping_mask())
}

#[inline]
fn unit(v: u8) -> f32 {
    v as f32 / 255.0
}

#[inline]
fn to_u8(v: f32) -> u8 {
    (v * 255.0).clamp(0.0, 255.0).round() as u8
}

#[inline]
fn color(px: &[u8]) -> [f32; 3] {
    [unit(px[0]), unit(px[1]), unit(px[2])]
}

/// Porter-Duff "over" of `fg` (coverage `fa`, already including opacity)
/// onto `bg`, keeping an output alpha:
/// `rgb = (blend(bg, fg)*fa + bg*ba*(1-fa)) / out_a`.
///
/// Over an opaque backdrop this is `blend*fa + bg*(1-fa)`, the same mix the
/// display composite uses.
#[inline]
fn over_pixel(bg: &[u8], fg: &[u8], fa: f32, mode: BlendMode) -> Bgra {
    let ba = unit(bg[3]);
    let out_a = fa + ba * (1.0 - fa);
    if out_a <= 0.0 {
        // Nothing covers this pixel; skip the division entirely.
        return [0, 0, 0, 0];
    }
    if fa <= 0.0 {
        return [bg[0], bg[1], bg[2], bg[3]];
    }

    let b = color(bg);
    let f = color(fg);
    let blended = mode.blend_rgb(b, f);

    let mut out = [0u8; 4];
    for c in 0..3 {
        let premul = blended[c] * fa + b[c] * ba * (1.0 - fa);
        out[c] = to_u8(premul / out_a);
    }
    out[3] = to_u8(out_a);
    out
}

/// Stateless apart from its settings; cheap to construct per call.
#[derive(Clone, Debug, Default)]
pub struct Compositor {
    settings: CompositorSettings,
}

impl Compositor {
    pub fn new(settings: CompositorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CompositorSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: CompositorSettings) {
        self.settings = settings;
    }

    /// Opaque light/dark checkerboard, light square at the origin.
    pub fn checkerboard(&self, width: u32, height: u32) -> CompositeResult<PixelBuffer> {
        let mut buf = PixelBuffer::create_blank(width, height)?;
        let size = self.settings.checker_size.max(1);
        let (light, dark) = self.settings.checker_colors();
        let stride = width as usize * CHANNELS;

        buf.as_raw_mut()
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                let cy = y as u32 / size;
                for (x, px) in row.chunks_exact_mut(CHANNELS).enumerate() {
                    let cx = x as u32 / size;
                    let c = if (cx + cy) % 2 == 0 { light } else { dark };
                    px.copy_from_slice(&[c[0], c[1], c[2], 255]);
                }
            });
        Ok(buf)
    }

    /// Layer image at canvas size, resampling only when dimensions differ.
    fn fit<'a>(&self, image: &'a PixelBuffer, width: u32, height: u32) -> CompositeResult<Cow<'a, PixelBuffer>> {
        if image.dimensions() == (width, height) {
            Ok(Cow::Borrowed(image))
        } else {
            Ok(Cow::Owned(image.resize_to(width, height, self.settings.resample_filter)?))
        }
    }

    /// Per-pixel coverage of layer `index`: `(alpha/255) * opacity`, further
    /// gated by the clip base's alpha and opacity for clipping layers.
    ///
    /// Returns `None` when the layer contributes nothing: hidden, zero
    /// opacity, clipping with no base below it, or zero alpha everywhere.
    fn coverage<'a>(
        &self,
        layers: &'a [Layer],
        index: usize,
        width: u32,
        height: u32,
    ) -> CompositeResult<Option<(Cow<'a, PixelBuffer>, Vec<f32>)>> {
        let layer = &layers[index];
        if !layer.contributes() {
            return Ok(None);
        }

        let clip_base = if layer.clipping_mask() {
            match resolve_clip_base(layers, index) {
                Some(j) => Some(&layers[j]),
                None => return Ok(None),
            }
        } else {
            None
        };

        let image = self.fit(layer.image(), width, height)?;
        let mut cov: Vec<f32> = image
            .as_raw()
            .par_chunks_exact(CHANNELS)
            .map(|px| unit(px[3]))
            .collect();

        if let Some(base) = clip_base {
            let base_image = self.fit(base.image(), width, height)?;
            let base_opacity = base.opacity();
            cov.par_iter_mut()
                .zip(base_image.as_raw().par_chunks_exact(CHANNELS))
                .for_each(|(c, px)| *c *= unit(px[3]) * base_opacity);
        }

        if cov.par_iter().all(|&c| c <= 0.0) {
            return Ok(None);
        }

        let opacity = layer.opacity();
        cov.par_iter_mut().for_each(|c| *c *= opacity);
        Ok(Some((image, cov)))
    }

    /// Flatten `layers` into the opaque display image, sized to the bottom
    /// layer.
    pub fn compose_layers(&self, layers: &[Layer]) -> CompositeResult<PixelBuffer> {
        let bottom = layers.first().ok_or_else(|| {
            crate::log_err!("compose_layers called with an empty layer stack");
            CompositeError::InvalidCompositeState("empty layer stack".into())
        })?;
        let (w, h) = bottom.image().dimensions();
        self.compose_layers_to(layers, w, h)
    }

    /// Flatten `layers` into an opaque `width × height` display image.
    /// Layers of other sizes are resampled before blending.
    pub fn compose_layers_to(&self, layers: &[Layer], width: u32, height: u32) -> CompositeResult<PixelBuffer> {
        if layers.is_empty() {
            crate::log_err!("compose_layers called with an empty layer stack");
            return Err(CompositeError::InvalidCompositeState("empty layer stack".into()));
        }
        if width == 0 || height == 0 {
            return Err(CompositeError::InvalidCompositeState(format!(
                "zero-sized canvas {}×{}",
                width, height
            )));
        }

        let mut composite = self.checkerboard(width, height)?;
        let stride = width as usize * CHANNELS;

        for (index, layer) in layers.iter().enumerate() {
            let Some((image, cov)) = self.coverage(layers, index, width, height)? else {
                continue;
            };
            let mode = layer.blend_mode();
            let src = image.as_raw();

            composite
                .as_raw_mut()
                .par_chunks_mut(stride)
                .enumerate()
                .for_each(|(y, row)| {
                    let src_row = &src[y * stride..(y + 1) * stride];
                    let cov_row = &cov[y * width as usize..(y + 1) * width as usize];
                    for (x, &f) in cov_row.iter().enumerate() {
                        if f <= 0.0 {
                            continue;
                        }
                        let o = x * CHANNELS;
                        let bg = color(&row[o..o + 3]);
                        let fg = color(&src_row[o..o + 3]);
                        let blended = mode.blend_rgb(bg, fg);
                        for c in 0..3 {
                            row[o + c] = to_u8(blended[c] * f + bg[c] * (1.0 - f));
                        }
                    }
                });
        }

        Ok(composite)
    }

    /// Composite exactly two layers, keeping an output alpha channel.
    /// `fg` is resampled to `bg`'s size if they differ.
    pub fn merge_two_layers(
        &self,
        bg: &PixelBuffer,
        fg: &PixelBuffer,
        fg_opacity: f32,
        mode: BlendMode,
    ) -> CompositeResult<PixelBuffer> {
        let (width, height) = bg.dimensions();
        let fg = self.fit(fg, width, height)?;
        let opacity = if fg_opacity.is_nan() { 0.0 } else { fg_opacity.clamp(0.0, 1.0) };

        let mut out = bg.clone();
        out.as_raw_mut()
            .par_chunks_exact_mut(CHANNELS)
            .zip(fg.as_raw().par_chunks_exact(CHANNELS))
            .for_each(|(px, top)| {
                let fa = unit(top[3]) * opacity;
                let merged = over_pixel(px, top, fa, mode);
                px.copy_from_slice(&merged);
            });
        Ok(out)
    }

    /// Flatten `layers` onto a transparent backdrop, keeping alpha. Same
    /// traversal and clip resolution as [`Self::compose_layers_to`].
    pub fn flatten_layers(&self, layers: &[Layer], width: u32, height: u32) -> CompositeResult<PixelBuffer> {
        if layers.is_empty() {
            return Err(CompositeError::InvalidCompositeState("empty layer stack".into()));
        }
        let mut acc = PixelBuffer::create_blank(width, height)?;

        for (index, layer) in layers.iter().enumerate() {
            let Some((image, cov)) = self.coverage(layers, index, width, height)? else {
                continue;
            };
            let mode = layer.blend_mode();
            acc.as_raw_mut()
                .par_chunks_exact_mut(CHANNELS)
                .zip(image.as_raw().par_chunks_exact(CHANNELS))
                .zip(cov.par_iter())
                .for_each(|((px, top), &fa)| {
                    let merged = over_pixel(px, top, fa, mode);
                    px.copy_from_slice(&merged);
                });
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Bgra = [0, 0, 255, 255];
    const BLUE: Bgra = [255, 0, 0, 255];

    fn compositor() -> Compositor {
        Compositor::default()
    }

    fn solid(name: &str, w: u32, h: u32, color: Bgra) -> Layer {
        Layer::filled(name, w, h, color).unwrap()
    }

    /// Deterministic non-uniform test pattern.
    fn pattern(name: &str, w: u32, h: u32, seed: u8, alpha: u8) -> Layer {
        let mut buf = PixelBuffer::create_blank(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                let v = (x * 37 + y * 91) as u8;
                buf.put_pixel(x, y, [v.wrapping_add(seed), v.wrapping_mul(3), seed, alpha]);
            }
        }
        Layer::new(name, buf)
    }

    fn assert_close(a: &PixelBuffer, b: &PixelBuffer, tol: u8) {
        assert_eq!(a.dimensions(), b.dimensions());
        for (i, (x, y)) in a.as_raw().iter().zip(b.as_raw()).enumerate() {
            assert!(x.abs_diff(*y) <= tol, "byte {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn empty_stack_is_invalid_state() {
        assert!(matches!(
            compositor().compose_layers(&[]),
            Err(CompositeError::InvalidCompositeState(_))
        ));
    }

    #[test]
    fn transparent_stack_shows_checkerboard() {
        let c = compositor();
        let layers = [Layer::blank("empty", 45, 45).unwrap()];
        let out = c.compose_layers(&layers).unwrap();
        let (light, dark) = c.settings().checker_colors();
        assert_eq!(out.pixel(0, 0), [light[0], light[1], light[2], 255]);
        assert_eq!(out.pixel(19, 19), [light[0], light[1], light[2], 255]);
        assert_eq!(out.pixel(20, 0), [dark[0], dark[1], dark[2], 255]);
        assert_eq!(out.pixel(20, 20), [light[0], light[1], light[2], 255]);
        assert_eq!(out.pixel(0, 44), [light[0], light[1], light[2], 255]);
    }

    #[test]
    fn output_is_always_opaque() {
        let layers = [pattern("a", 7, 5, 3, 90), pattern("b", 7, 5, 9, 10)];
        let out = compositor().compose_layers(&layers).unwrap();
        assert!(out.as_raw().chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn normal_full_opacity_is_idempotent() {
        let top = pattern("top", 6, 4, 17, 255);
        for base_alpha in [0u8, 128, 255] {
            let layers = [pattern("base", 6, 4, 200, base_alpha), top.clone()];
            let out = compositor().compose_layers(&layers).unwrap();
            for y in 0..4 {
                for x in 0..6 {
                    let expected = top.image().pixel(x, y);
                    assert_eq!(&out.pixel(x, y)[..3], &expected[..3]);
                }
            }
        }
    }

    #[test]
    fn zero_opacity_layer_is_a_no_op() {
        let base = pattern("base", 5, 5, 40, 200);
        let without = compositor().compose_layers(std::slice::from_ref(&base)).unwrap();
        for &mode in BlendMode::all() {
            let top = pattern("top", 5, 5, 99, 255).with_opacity(0.0).with_blend_mode(mode);
            let with = compositor().compose_layers(&[base.clone(), top]).unwrap();
            assert_eq!(with, without, "{}", mode);
        }
    }

    #[test]
    fn transparent_layer_is_a_no_op() {
        let base = pattern("base", 5, 5, 40, 255);
        let without = compositor().compose_layers(std::slice::from_ref(&base)).unwrap();
        for &mode in BlendMode::all() {
            let top = pattern("top", 5, 5, 99, 0).with_blend_mode(mode);
            let with = compositor().compose_layers(&[base.clone(), top]).unwrap();
            assert_eq!(with, without, "{}", mode);
        }
    }

    #[test]
    fn hidden_layer_is_skipped() {
        let base = solid("base", 2, 2, RED);
        let top = solid("top", 2, 2, BLUE).with_visible(false);
        let out = compositor().compose_layers(&[base, top]).unwrap();
        assert_eq!(out.pixel(1, 1), RED);
    }

    #[test]
    fn half_opacity_blue_over_red() {
        let layers = [solid("red", 2, 2, RED), solid("blue", 2, 2, BLUE).with_opacity(0.5)];
        let out = compositor().compose_layers(&layers).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                let [b, g, r, a] = out.pixel(x, y);
                assert!(r == 127 || r == 128, "r = {}", r);
                assert!(b == 127 || b == 128, "b = {}", b);
                assert_eq!(g, 0);
                assert_eq!(a, 255);
            }
        }
    }

    #[test]
    fn multiply_scenario() {
        let layers = [
            solid("base", 1, 1, [200, 200, 200, 255]),
            solid("top", 1, 1, [100, 100, 100, 255]).with_blend_mode(BlendMode::Multiply),
        ];
        let out = compositor().compose_layers(&layers).unwrap();
        assert_eq!(out.pixel(0, 0), [78, 78, 78, 255]);
    }

    #[test]
    fn clip_base_resolution_skips_clipping_layers() {
        let layers = [
            solid("base", 1, 1, RED),
            solid("clip1", 1, 1, BLUE).with_clipping_mask(true),
            solid("clip2", 1, 1, BLUE).with_clipping_mask(true),
            solid("plain", 1, 1, BLUE),
            solid("clip3", 1, 1, BLUE).with_clipping_mask(true),
        ];
        assert_eq!(resolve_clip_base(&layers, 1), Some(0));
        assert_eq!(resolve_clip_base(&layers, 2), Some(0));
        assert_eq!(resolve_clip_base(&layers, 4), Some(3));
        assert_eq!(resolve_clip_base(&layers, 0), None);
        assert_eq!(resolve_clip_base(&layers, 9), None);

        let orphan = [solid("a", 1, 1, RED).with_clipping_mask(true)];
        assert_eq!(resolve_clip_base(&orphan, 0), None);
    }

    #[test]
    fn clipping_to_transparent_base_hides_layer() {
        let bottom = solid("bottom", 3, 3, RED);
        let base = Layer::blank("empty base", 3, 3).unwrap();
        let clip = solid("clip", 3, 3, BLUE).with_clipping_mask(true);
        let without = compositor().compose_layers(&[bottom.clone(), base.clone()]).unwrap();
        let with = compositor().compose_layers(&[bottom, base, clip]).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn clipping_follows_base_alpha_and_opacity() {
        // Base covers only the left column; the clip layer must only show there.
        let mut base_buf = PixelBuffer::create_blank(2, 1).unwrap();
        base_buf.put_pixel(0, 0, RED);
        let layers = [
            solid("bg", 2, 1, [0, 255, 0, 255]),
            Layer::new("base", base_buf).with_opacity(0.5),
            solid("clip", 2, 1, BLUE).with_clipping_mask(true),
        ];
        let out = compositor().compose_layers(&layers).unwrap();
        // Right pixel: untouched green background.
        assert_eq!(out.pixel(1, 0), [0, 255, 0, 255]);
        // Left pixel: base at 50% over green, then blue at 50% coverage.
        let [b, g, r, _] = out.pixel(0, 0);
        assert!(b.abs_diff(128) <= 1, "b = {}", b);
        assert!(g.abs_diff(64) <= 1, "g = {}", g);
        assert!(r.abs_diff(64) <= 1, "r = {}", r);
    }

    #[test]
    fn clipping_flag_on_bottom_layer_does_not_panic() {
        let layers = [solid("bottom", 2, 2, RED).with_clipping_mask(true)];
        let out = compositor().compose_layers(&layers).unwrap();
        let checker = compositor().checkerboard(2, 2).unwrap();
        assert_eq!(out, checker);
    }

    #[test]
    fn mismatched_layer_is_resampled() {
        let layers = [solid("base", 4, 4, RED), solid("small", 2, 2, BLUE)];
        let out = compositor().compose_layers(&layers).unwrap();
        assert_eq!(out.dimensions(), (4, 4));
        let px = out.pixel(3, 3);
        assert!(px.iter().zip(BLUE).all(|(a, b)| a.abs_diff(b) <= 2), "{:?}", px);
    }

    #[test]
    fn merge_of_transparent_layers_is_zero() {
        let mut bg = PixelBuffer::create_blank(3, 3).unwrap();
        bg.fill([50, 60, 70, 0]);
        let mut fg = PixelBuffer::create_blank(3, 3).unwrap();
        fg.fill([80, 90, 100, 0]);
        for &mode in BlendMode::all() {
            let merged = compositor().merge_two_layers(&bg, &fg, 1.0, mode).unwrap();
            assert!(merged.as_raw().iter().all(|&v| v == 0), "{}", mode);
        }
    }

    #[test]
    fn merge_keeps_output_alpha() {
        let bg = PixelBuffer::new_filled(1, 1, [0, 0, 255, 128]).unwrap();
        let fg = PixelBuffer::new_filled(1, 1, [255, 0, 0, 128]).unwrap();
        let merged = compositor().merge_two_layers(&bg, &fg, 1.0, BlendMode::Normal).unwrap();
        // 0.502 + 0.502 * 0.498 ≈ 0.752
        assert!(merged.alpha(0, 0).abs_diff(192) <= 1);
        let [b, _, r, _] = merged.pixel(0, 0);
        assert!(b > r, "top color should dominate: {:?}", merged.pixel(0, 0));
    }

    #[test]
    fn merge_blends_against_translucent_backdrop_color() {
        // Multiply against a half-transparent red backdrop: the blend result
        // is taken as-is for a fully covering top layer.
        let bg = PixelBuffer::new_filled(1, 1, [0, 0, 255, 128]).unwrap();
        let fg = PixelBuffer::new_filled(1, 1, [128, 128, 128, 255]).unwrap();
        let merged = compositor().merge_two_layers(&bg, &fg, 1.0, BlendMode::Multiply).unwrap();
        assert_eq!(merged.pixel(0, 0), [0, 0, 128, 255]);
    }

    #[test]
    fn multiply_over_transparent_backdrop_is_black() {
        let bg = PixelBuffer::create_blank(1, 1).unwrap();
        let fg = PixelBuffer::new_filled(1, 1, [10, 120, 200, 255]).unwrap();
        let merged = compositor().merge_two_layers(&bg, &fg, 1.0, BlendMode::Multiply).unwrap();
        assert_eq!(merged.pixel(0, 0), [0, 0, 0, 255]);
        let normal = compositor().merge_two_layers(&bg, &fg, 1.0, BlendMode::Normal).unwrap();
        assert_eq!(normal.pixel(0, 0), [10, 120, 200, 255]);
    }

    #[test]
    fn merge_down_preserves_visual_result() {
        let base = pattern("base", 9, 7, 31, 255);
        for &mode in BlendMode::all() {
            let top = pattern("top", 9, 7, 77, 140).with_opacity(0.6).with_blend_mode(mode);
            let c = compositor();
            let stacked = c.compose_layers(&[base.clone(), top.clone()]).unwrap();
            let merged_buf = c
                .merge_two_layers(base.image(), top.image(), top.opacity(), mode)
                .unwrap();
            let merged = c.compose_layers(&[Layer::new("merged", merged_buf)]).unwrap();
            assert_close(&stacked, &merged, 1);
        }
    }

    #[test]
    fn merge_down_over_translucent_base_normal_mode() {
        let base = pattern("base", 9, 7, 31, 100);
        let top = pattern("top", 9, 7, 77, 180).with_opacity(0.7);
        let c = compositor();
        let stacked = c.compose_layers(&[base.clone(), top.clone()]).unwrap();
        let merged_buf = c
            .merge_two_layers(base.image(), top.image(), top.opacity(), BlendMode::Normal)
            .unwrap();
        let merged = c.compose_layers(&[Layer::new("merged", merged_buf)]).unwrap();
        assert_close(&stacked, &merged, 2);
    }

    #[test]
    fn flatten_matches_compose_for_normal_layers() {
        let layers = [
            pattern("a", 6, 6, 1, 255),
            pattern("b", 6, 6, 50, 120).with_opacity(0.8),
            pattern("c", 6, 6, 90, 200).with_clipping_mask(true).with_opacity(0.5),
        ];
        let c = compositor();
        let flat = c.flatten_layers(&layers, 6, 6).unwrap();
        assert!(flat.as_raw().chunks_exact(4).all(|px| px[3] == 255));
        let direct = c.compose_layers(&layers).unwrap();
        let via_flat = c.compose_layers(&[Layer::new("flat", flat)]).unwrap();
        assert_close(&direct, &via_flat, 2);
    }

    #[test]
    fn flatten_of_hidden_stack_is_transparent() {
        let layers = [solid("a", 2, 2, RED).with_visible(false)];
        let flat = compositor().flatten_layers(&layers, 2, 2).unwrap();
        assert!(flat.is_fully_transparent());
    }
}
