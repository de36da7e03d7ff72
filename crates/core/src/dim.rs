use std::{
    fmt,
    ops::{Deref, Index},
    slice::SliceIndex,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single tensor dimension. `Batch` is the symbolic, runtime-determined
/// leading dimension. It is `null` in JSON and `B` in text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<usize>", into = "Option<usize>")]
pub enum Dimension {
    Static(usize),
    Batch,
}

/// An ordered sequence of dimensions, i.e. the shape flowing through a port.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimensions(pub Vec<Dimension>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid dimension '{0}' (expected a non-negative integer or 'B')")]
pub struct ParseDimensionError(pub String);

impl Dimension {
    pub fn as_static(self) -> Option<usize> {
        match self {
            Dimension::Static(d) => Some(d),
            Dimension::Batch => None,
        }
    }

    /// Equal sizes, or batch against batch. There is no broadcasting, so a
    /// static `1` does not match anything else.
    pub fn is_compatible(self, other: Self) -> bool {
        self == other
    }
}

impl Dimensions {
    /// `[B, features...]`
    pub fn batched(features: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(features.len() + 1);
        dims.push(Dimension::Batch);
        dims.extend(features.iter().map(|&d| Dimension::Static(d)));
        Self(dims)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Dimension] {
        self.0.as_slice()
    }

    pub fn last(&self) -> Option<Dimension> {
        self.0.last().copied()
    }

    /// Equal rank and every dimension pairwise compatible. No broadcasting.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(&x, &y)| x.is_compatible(y))
    }

    /// Product of the given dimensions. Symbolic if any of them is symbolic,
    /// `None` if it does not fit in a `usize`.
    pub fn product(dims: &[Dimension]) -> Option<Dimension> {
        if dims.contains(&Dimension::Batch) {
            return Some(Dimension::Batch);
        }
        dims.iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(d.as_static()?))
            .map(Dimension::Static)
    }

    /// Returns the shape with its last dimension replaced.
    pub fn with_last(&self, dim: Dimension) -> Self {
        let mut dims = self.0.clone();
        if let Some(last) = dims.last_mut() {
            *last = dim;
        }
        Self(dims)
    }

    /// Resolves a possibly negative axis against this shape's rank.
    pub fn normalize_axis(&self, axis: i64) -> Option<usize> {
        let rank = self.len() as i64;
        let axis = if axis < 0 { axis + rank } else { axis };
        (0..rank).contains(&axis).then_some(axis as usize)
    }
}

impl From<Option<usize>> for Dimension {
    fn from(d: Option<usize>) -> Self {
        d.map_or(Dimension::Batch, Dimension::Static)
    }
}

impl From<Dimension> for Option<usize> {
    fn from(d: Dimension) -> Self {
        d.as_static()
    }
}

impl From<usize> for Dimension {
    fn from(d: usize) -> Self {
        Dimension::Static(d)
    }
}

impl From<Vec<Dimension>> for Dimensions {
    fn from(v: Vec<Dimension>) -> Dimensions {
        Dimensions(v)
    }
}

impl FromStr for Dimension {
    type Err = ParseDimensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "B" | "b" | "?" | "null" => Ok(Dimension::Batch),
            s => s
                .parse::<usize>()
                .map(Dimension::Static)
                .map_err(|_| ParseDimensionError(s.to_owned())),
        }
    }
}

/// Parses `B,1,28,28` or `[B, 1, 28, 28]`.
impl FromStr for Dimensions {
    type Err = ParseDimensionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(s);
        if s.trim().is_empty() {
            return Ok(Dimensions::default());
        }
        s.split(',')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Dimensions)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(d) => write!(f, "{d}"),
            Dimension::Batch => write!(f, "B"),
        }
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<I> Index<I> for Dimensions
where
    I: SliceIndex<[Dimension]>,
{
    type Output = <I as SliceIndex<[Dimension]>>::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.0[index]
    }
}

impl Deref for Dimensions {
    type Target = Vec<Dimension>;
    fn deref(&self) -> &Vec<Dimension> {
        &self.0
    }
}

#[test]
fn product() {
    let dims = Dimensions::batched(&[1, 28, 28]);
    assert_eq!(Dimensions::product(&dims[1..]), Some(Dimension::Static(784)));
    assert_eq!(Dimensions::product(&dims), Some(Dimension::Batch));
    assert_eq!(Dimensions::product(&[]), Some(Dimension::Static(1)));

    let huge = Dimensions::batched(&[1 << 40, 1 << 40]);
    assert_eq!(Dimensions::product(&huge[1..]), None);
    assert_eq!(Dimensions::product(&huge), Some(Dimension::Batch));
}

#[test]
fn compatible() {
    let x = Dimensions::batched(&[784]);
    assert!(x.is_compatible(&Dimensions::batched(&[784])));
    assert!(!x.is_compatible(&Dimensions::batched(&[512])));
    assert!(!x.is_compatible(&Dimensions(vec![Dimension::Static(1), 784.into()])));
    assert!(!x.is_compatible(&Dimensions::batched(&[1, 784])));
    assert!(!Dimension::Static(1).is_compatible(Dimension::Static(784)));
    assert!(!Dimension::Static(1).is_compatible(Dimension::Batch));
}

#[test]
fn parse_and_display() {
    let dims: Dimensions = "B,1,28,28".parse().unwrap();
    assert_eq!(dims, Dimensions::batched(&[1, 28, 28]));
    let dims: Dimensions = "[?, 784]".parse().unwrap();
    assert_eq!(dims.to_string(), "[B, 784]");
    assert!("B,x".parse::<Dimensions>().is_err());
}

#[test]
fn json_uses_null_for_batch() {
    let dims = Dimensions::batched(&[3, 224, 224]);
    let json = serde_json::to_string(&dims).unwrap();
    assert_eq!(json, "[null,3,224,224]");
    let back: Dimensions = serde_json::from_str(&json).unwrap();
    assert_eq!(back, dims);
}

#[test]
fn normalize_axis() {
    let dims = Dimensions::batched(&[8, 16]);
    assert_eq!(dims.normalize_axis(-1), Some(2));
    assert_eq!(dims.normalize_axis(1), Some(1));
    assert_eq!(dims.normalize_axis(3), None);
    assert_eq!(dims.normalize_axis(-4), None);
}
