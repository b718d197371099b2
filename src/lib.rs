//! Layer compositing and blending engine.
//!
//! A [`LayerStack`](layer_stack::LayerStack) holds BGRA layers with opacity,
//! visibility, blend mode and clipping-mask metadata; the
//! [`Compositor`](compositor::Compositor) flattens them over a checkerboard
//! for display, or with real alpha when layers are merged.

pub mod logger;

pub mod blend;
pub mod canvas;
pub mod cli;
pub mod compositor;
pub mod error;
pub mod io;
pub mod layer;
pub mod layer_stack;
pub mod settings;
