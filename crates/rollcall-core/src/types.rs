use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical key of an enrolled person (the external student identifier).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key of an attendance-taking session owned by the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Face bounding box in original-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clamp the box to a `width × height` frame. Returns `None` when nothing
    /// of the box remains inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(FaceBox {
            x: self.x,
            y: self.y,
            width: w,
            height: h,
        })
    }
}

/// Outcome of classifying one face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "identity", rename_all = "snake_case")]
pub enum Recognition {
    Identified(Identity),
    Unknown,
}

impl Recognition {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Recognition::Identified(id) => Some(id),
            Recognition::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Recognition::Unknown)
    }

    /// Display tag: the identity, or `"Unknown"`.
    pub fn tag(&self) -> &str {
        match self {
            Recognition::Identified(id) => id.as_str(),
            Recognition::Unknown => "Unknown",
        }
    }
}

/// A detected face enriched with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub bbox: FaceBox,
    pub recognition: Recognition,
    /// Raw classifier distance (0 = perfect). `None` when the classifier is untrained.
    pub distance: Option<f64>,
    /// `max(0, 100 - distance)`, rounded to two decimals. Higher is better.
    pub confidence: f64,
}

/// Convert a classifier distance into the displayed confidence score.
///
/// Lower distance means higher trust, so the scale is inverted and clamped
/// at zero.
pub fn confidence_from_distance(distance: f64) -> f64 {
    let confidence = (100.0 - distance).max(0.0);
    (confidence * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_perfect_match() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
    }

    #[test]
    fn test_confidence_inverts_distance() {
        assert!((confidence_from_distance(42.5) - 57.5).abs() < 1e-9);
        assert!(confidence_from_distance(10.0) > confidence_from_distance(20.0));
    }

    #[test]
    fn test_confidence_clamped_at_zero() {
        assert_eq!(confidence_from_distance(100.0), 0.0);
        assert_eq!(confidence_from_distance(250.0), 0.0);
    }

    #[test]
    fn test_confidence_rounded_two_decimals() {
        assert_eq!(confidence_from_distance(33.33333), 66.67);
    }

    #[test]
    fn test_face_box_clamp_inside() {
        let b = FaceBox { x: 10, y: 10, width: 20, height: 20 };
        assert_eq!(b.clamp_to(100, 100), Some(b));
    }

    #[test]
    fn test_face_box_clamp_overhang() {
        let b = FaceBox { x: 90, y: 95, width: 20, height: 20 };
        let clamped = b.clamp_to(100, 100).unwrap();
        assert_eq!(clamped.width, 10);
        assert_eq!(clamped.height, 5);
    }

    #[test]
    fn test_face_box_clamp_outside() {
        let b = FaceBox { x: 100, y: 0, width: 20, height: 20 };
        assert!(b.clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_recognition_tag() {
        assert_eq!(Recognition::Unknown.tag(), "Unknown");
        let r = Recognition::Identified(Identity::from("123/A"));
        assert_eq!(r.tag(), "123/A");
        assert_eq!(r.identity().map(Identity::as_str), Some("123/A"));
    }
}
