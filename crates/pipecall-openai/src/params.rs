//! Image request parameters.
//!
//! Count and size arrive as optional positional strings. A missing or
//! unparsable count falls back to the default; a missing size falls back to
//! the default, but a size that is present must be one of the supported ones.

use std::fmt;
use std::str::FromStr;

use pipecall::config::env_parse;

pub const MAX_IMAGE_COUNT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    S256,
    S512,
    #[default]
    S1024,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::S256 => "256x256",
            ImageSize::S512 => "512x512",
            ImageSize::S1024 => "1024x1024",
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Image size invalid!")]
pub struct InvalidSize(pub String);

impl FromStr for ImageSize {
    type Err = InvalidSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "256x256" => Ok(ImageSize::S256),
            "512x512" => Ok(ImageSize::S512),
            "1024x1024" => Ok(ImageSize::S1024),
            other => Err(InvalidSize(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDefaults {
    pub count: u8,
    pub size: ImageSize,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            count: 1,
            size: ImageSize::default(),
        }
    }
}

impl ImageDefaults {
    /// Reads `PIPECALL_IMAGE_COUNT` and `PIPECALL_IMAGE_SIZE`.
    pub fn from_env() -> Self {
        let mut defaults = Self::default();
        if let Some(count) = env_parse::<u8>("PIPECALL_IMAGE_COUNT") {
            defaults.count = count.clamp(1, MAX_IMAGE_COUNT);
        }
        if let Some(size) = env_parse::<ImageSize>("PIPECALL_IMAGE_SIZE") {
            defaults.size = size;
        }
        defaults
    }

    pub fn count(&self, raw: Option<&str>) -> u8 {
        let parsed = raw
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(i64::from(self.count));
        parsed.clamp(1, i64::from(MAX_IMAGE_COUNT)) as u8
    }

    pub fn size(&self, raw: Option<&str>) -> Result<ImageSize, InvalidSize> {
        match raw {
            Some(s) if !s.is_empty() => s.parse(),
            _ => Ok(self.size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_defaults_and_clamps() {
        let d = ImageDefaults::default();
        assert_eq!(d.count(None), 1);
        assert_eq!(d.count(Some("three")), 1);
        assert_eq!(d.count(Some("4")), 4);
        assert_eq!(d.count(Some("12")), 10);
        assert_eq!(d.count(Some("0")), 1);
        assert_eq!(d.count(Some("-5")), 1);
        assert_eq!(d.count(Some("99999999999999999999")), 1);
    }

    #[test]
    fn size_defaults_and_validates() {
        let d = ImageDefaults::default();
        assert_eq!(d.size(None), Ok(ImageSize::S1024));
        assert_eq!(d.size(Some("512x512")), Ok(ImageSize::S512));
        assert_eq!(
            d.size(Some("800x600")),
            Err(InvalidSize("800x600".to_string()))
        );
    }

    #[test]
    fn size_strings() {
        for size in [ImageSize::S256, ImageSize::S512, ImageSize::S1024] {
            assert_eq!(size.to_string().parse::<ImageSize>(), Ok(size));
        }
    }

    #[test]
    fn custom_defaults_apply() {
        let d = ImageDefaults {
            count: 3,
            size: ImageSize::S256,
        };
        assert_eq!(d.count(Some("junk")), 3);
        assert_eq!(d.size(None), Ok(ImageSize::S256));
    }
}
