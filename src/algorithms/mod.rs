//! Built-in detector and descriptor providers, plus the approximate nearest
//! neighbour indices used by the indexed matcher.

pub mod akaze;
pub mod brief;
pub mod brisk;
pub mod corners;
pub mod fast;
pub mod freak;
pub mod kdtree;
pub mod lsh;
pub mod orb;
pub mod scale_space;
pub mod sift;
