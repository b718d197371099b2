use serde::{Deserialize, Serialize};

/// Per-pixel rule governing how a layer's color combines with what lies
/// beneath it. All math runs per channel in normalized [0, 1] space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
    Addition,
    SoftLight,
}

impl BlendMode {
    /// Returns all blend modes in menu order
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::Difference,
            BlendMode::Addition,
            BlendMode::SoftLight,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::Difference => "Difference",
            BlendMode::Addition => "Addition",
            BlendMode::SoftLight => "Soft Light",
        }
    }

    /// Parse a user-facing name. Case, spaces, dashes and underscores are
    /// ignored; anything unrecognised is Normal.
    pub fn from_name(name: &str) -> Self {
        let key: String = name
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "multiply" => BlendMode::Multiply,
            "screen" => BlendMode::Screen,
            "overlay" => BlendMode::Overlay,
            "darken" => BlendMode::Darken,
            "lighten" => BlendMode::Lighten,
            "difference" => BlendMode::Difference,
            "addition" | "add" | "additive" => BlendMode::Addition,
            "softlight" => BlendMode::SoftLight,
            _ => BlendMode::Normal,
        }
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::Difference => 6,
            BlendMode::Addition => 7,
            BlendMode::SoftLight => 8,
        }
    }

    /// Reconstruct from a u8 (defaults to Normal for unknown values)
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => BlendMode::Multiply,
            2 => BlendMode::Screen,
            3 => BlendMode::Overlay,
            4 => BlendMode::Darken,
            5 => BlendMode::Lighten,
            6 => BlendMode::Difference,
            7 => BlendMode::Addition,
            8 => BlendMode::SoftLight,
            _ => BlendMode::Normal,
        }
    }

    /// Blend one normalized channel. `bg` is the base, `fg` the top layer.
    #[inline]
    pub fn blend_channel(self, bg: f32, fg: f32) -> f32 {
        let v = match self {
            BlendMode::Normal => fg,
            BlendMode::Multiply => bg * fg,
            BlendMode::Screen => 1.0 - (1.0 - bg) * (1.0 - fg),
            BlendMode::Overlay => overlay_channel(bg, fg),
            BlendMode::Darken => bg.min(fg),
            BlendMode::Lighten => bg.max(fg),
            BlendMode::Difference => (bg - fg).abs(),
            BlendMode::Addition => bg + fg,
            BlendMode::SoftLight => soft_light_channel(bg, fg),
        };
        v.clamp(0.0, 1.0)
    }

    /// Blend a whole pixel's color channels (order is irrelevant, each
    /// channel is independent).
    #[inline]
    pub fn blend_rgb(self, bg: [f32; 3], fg: [f32; 3]) -> [f32; 3] {
        [
            self.blend_channel(bg[0], fg[0]),
            self.blend_channel(bg[1], fg[1]),
            self.blend_channel(bg[2], fg[2]),
        ]
    }
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn overlay_channel(bg: f32, fg: f32) -> f32 {
    if bg < 0.5 {
        2.0 * bg * fg
    } else {
        1.0 - 2.0 * (1.0 - bg) * (1.0 - fg)
    }
}

/// Pegtop soft light.
fn soft_light_channel(bg: f32, fg: f32) -> f32 {
    (1.0 - 2.0 * fg) * bg * bg + 2.0 * fg * bg
}
