//! Fixed color palette shared by the canvas and its clients.
//!
//! Cells store a one-byte [`ColorIndex`] into the palette instead of the
//! color string, which keeps a 1000×1000 grid compact. Strings only appear
//! at the edges: validating a placement and encoding outgoing messages.

use serde::{Deserialize, Serialize};

/// The classic 16-color r/place set.
pub const DEFAULT_PALETTE: &[&str] = &[
    "#000000", "#FFFFFF", "#FF4500", "#FFA800", "#FFD635", "#00A368", "#00CC78", "#7EED56",
    "#2450A4", "#3690EA", "#51E0ED", "#811E9F", "#B44AC0", "#FF99AA", "#6D482F", "#9C6926",
];

/// Largest palette addressable by a one-byte index.
pub const MAX_PALETTE_LEN: usize = 256;

/// Position of a color inside a [`Palette`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColorIndex(pub u8);

/// Ordered, duplicate-free list of allowed colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<String>,
}

impl Palette {
    /// Build a palette, rejecting empty, oversized or duplicated input and
    /// entries that are blank after trimming.
    ///
    /// Duplicates are detected ASCII-case-insensitively, so `#ff0000` and
    /// `#FF0000` cannot both be present.
    pub fn new<I, S>(colors: I) -> Result<Self, PaletteError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for color in colors {
            let color = color.into().trim().to_string();
            if color.is_empty() {
                return Err(PaletteError::BlankColor(list.len()));
            }
            if list.iter().any(|c| c.eq_ignore_ascii_case(&color)) {
                return Err(PaletteError::Duplicate(color));
            }
            list.push(color);
        }

        if list.is_empty() {
            return Err(PaletteError::Empty);
        }
        if list.len() > MAX_PALETTE_LEN {
            return Err(PaletteError::TooManyColors(list.len()));
        }

        Ok(Self { colors: list })
    }

    /// Find the index of `color`, ignoring ASCII case.
    pub fn lookup(&self, color: &str) -> Option<ColorIndex> {
        let color = color.trim();
        self.colors
            .iter()
            .position(|c| c.eq_ignore_ascii_case(color))
            .map(|i| ColorIndex(i as u8))
    }

    /// Canonical spelling of the color at `index`.
    pub fn color(&self, index: ColorIndex) -> Option<&str> {
        self.colors.get(index.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn colors(&self) -> &[String] {
        &self.colors
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Palette construction errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaletteError {
    Empty,
    /// Entry at this position is blank after trimming
    BlankColor(usize),
    TooManyColors(usize),
    Duplicate(String),
}

impl std::fmt::Display for PaletteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Palette must contain at least one color"),
            Self::BlankColor(i) => write!(f, "Palette color at position {i} is blank"),
            Self::TooManyColors(n) => {
                write!(f, "Palette has {n} colors, at most {MAX_PALETTE_LEN} are supported")
            }
            Self::Duplicate(c) => write!(f, "Duplicate palette color: {c}"),
        }
    }
}

impl std::error::Error for PaletteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_palette() {
        let palette = Palette::default();
        assert_eq!(palette.len(), 16);
        assert_eq!(palette.color(ColorIndex(0)), Some("#000000"));
        assert_eq!(palette.color(ColorIndex(15)), Some("#9C6926"));
        assert_eq!(palette.color(ColorIndex(16)), None);
    }

    #[test]
    fn test_lookup_ignores_case() {
        let palette = Palette::default();
        assert_eq!(palette.lookup("#ff4500"), Some(ColorIndex(2)));
        assert_eq!(palette.lookup(" #FF4500 "), Some(ColorIndex(2)));
        assert_eq!(palette.lookup("#123456"), None);
        assert_eq!(palette.lookup(""), None);
    }

    #[test]
    fn test_custom_palette_names() {
        let palette = Palette::new(["#FF0000", "#00FF00", "blue"]).unwrap();
        assert_eq!(palette.lookup("BLUE"), Some(ColorIndex(2)));
        assert_eq!(palette.color(ColorIndex(2)), Some("blue"));
    }

    #[test]
    fn test_rejects_empty() {
        let colors: Vec<String> = Vec::new();
        assert_eq!(Palette::new(colors), Err(PaletteError::Empty));
    }

    #[test]
    fn test_rejects_blank_color() {
        assert_eq!(
            Palette::new(["#000000", "   ", "#FFFFFF"]),
            Err(PaletteError::BlankColor(1))
        );
        assert_eq!(Palette::new([""]), Err(PaletteError::BlankColor(0)));
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = Palette::new(["#abcdef", "#ABCDEF"]).unwrap_err();
        assert_eq!(err, PaletteError::Duplicate("#ABCDEF".to_string()));
    }

    #[test]
    fn test_rejects_oversized() {
        let colors: Vec<String> = (0..257).map(|i| format!("#{i:06X}")).collect();
        assert_eq!(Palette::new(colors), Err(PaletteError::TooManyColors(257)));

        let colors: Vec<String> = (0..256).map(|i| format!("#{i:06X}")).collect();
        let palette = Palette::new(colors).unwrap();
        assert_eq!(palette.lookup("#0000FF"), Some(ColorIndex(255)));
    }
}
