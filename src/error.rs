// ============================================================================
// ERRORS — structural rejections raised at the LayerStack / Layer boundary
// ============================================================================

/// Error type for layer and compositing operations.
///
/// Numeric edge cases (zero alpha, empty clip regions) are never reported
/// here; the blend and composite code guards them inline.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeError {
    /// A buffer with zero width/height or a malformed byte payload.
    InvalidImage(String),
    /// Delete attempted on a stack holding a single layer.
    CannotDeleteLastLayer,
    /// Composite requested on an empty stack (programming error).
    InvalidCompositeState(String),
    IndexOutOfRange { index: usize, len: usize },
    /// Merge attempted on the bottom layer; there is nothing to merge into.
    NoLayerBelow,
    /// Index 0 has nothing below it to clip to.
    ClippingOnBottomLayer,
}

impl std::fmt::Display for CompositeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompositeError::InvalidImage(e) => write!(f, "Invalid image: {}", e),
            CompositeError::CannotDeleteLastLayer => {
                write!(f, "Cannot delete the last remaining layer")
            }
            CompositeError::InvalidCompositeState(e) => {
                write!(f, "Invalid composite state: {}", e)
            }
            CompositeError::IndexOutOfRange { index, len } => {
                write!(f, "Layer index {} out of range (stack has {} layers)", index, len)
            }
            CompositeError::NoLayerBelow => {
                write!(f, "There is no layer below to merge into")
            }
            CompositeError::ClippingOnBottomLayer => {
                write!(f, "The bottom layer cannot be a clipping mask")
            }
        }
    }
}

impl std::error::Error for CompositeError {}

pub type CompositeResult<T> = Result<T, CompositeError>;
