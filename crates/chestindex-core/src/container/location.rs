//! Block positions and multi-block container topology

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChestError, ChestResult};

/// A block position in a named world.
///
/// Ordering is by value (world, then x, y, z), which makes the type usable as a
/// map key for per-container state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationData {
    world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl LocationData {
    /// Create a location. The world identifier must be non-empty.
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> ChestResult<Self> {
        let world = world.into();
        if world.trim().is_empty() {
            return Err(ChestError::InvalidLocation(
                "world identifier must not be empty".to_string(),
            ));
        }
        Ok(Self { world, x, y, z })
    }

    pub fn world(&self) -> &str {
        &self.world
    }

    /// Squared block distance, or `None` across worlds. Exact for any pair of
    /// `i32` coordinates.
    pub fn distance_squared(&self, other: &LocationData) -> Option<i128> {
        if self.world != other.world {
            return None;
        }
        let dx = i128::from(self.x) - i128::from(other.x);
        let dy = i128::from(self.y) - i128::from(other.y);
        let dz = i128::from(self.z) - i128::from(other.z);
        Some(dx * dx + dy * dy + dz * dz)
    }

    /// Key used by selection order for multi-block containers: x, then z, then y.
    fn primary_order_key(&self) -> (i32, i32, i32) {
        (self.x, self.z, self.y)
    }
}

impl fmt::Display for LocationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{},{},{}", self.world, self.x, self.y, self.z)
    }
}

/// Every block a container occupies, grouped under one canonical primary location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLocations {
    primary_location: LocationData,
    all_locations: BTreeSet<LocationData>,
}

impl ContainerLocations {
    /// Group `all` under `primary`. The primary is always part of the set.
    pub fn new(primary: LocationData, all: impl IntoIterator<Item = LocationData>) -> Self {
        let mut all_locations: BTreeSet<LocationData> = all.into_iter().collect();
        all_locations.insert(primary.clone());
        Self {
            primary_location: primary,
            all_locations,
        }
    }

    /// A single-block container
    pub fn single(location: LocationData) -> Self {
        Self::new(location, std::iter::empty())
    }

    pub fn primary_location(&self) -> &LocationData {
        &self.primary_location
    }

    pub fn all_locations(&self) -> &BTreeSet<LocationData> {
        &self.all_locations
    }

    pub fn is_multi_block(&self) -> bool {
        self.all_locations.len() > 1
    }

    pub fn contains(&self, location: &LocationData) -> bool {
        self.all_locations.contains(location)
    }
}

/// Resolve the two halves of a double chest to one canonical container.
///
/// The primary is the half with the smallest X, then smallest Z, then smallest Y,
/// so the result is the same whichever half triggered the event.
pub fn resolve_double_chest_locations(
    first: &LocationData,
    second: &LocationData,
) -> ChestResult<ContainerLocations> {
    if first.world != second.world {
        return Err(ChestError::InvalidLocation(format!(
            "double chest halves are in different worlds: {} and {}",
            first, second
        )));
    }
    if first == second {
        return Ok(ContainerLocations::single(first.clone()));
    }

    let horizontal = (first.x - second.x).abs() + (first.z - second.z).abs();
    if horizontal != 1 || first.y != second.y {
        return Err(ChestError::InvalidLocation(format!(
            "{} and {} are not adjacent chest halves",
            first, second
        )));
    }

    let primary = if first.primary_order_key() <= second.primary_order_key() {
        first
    } else {
        second
    };
    Ok(ContainerLocations::new(
        primary.clone(),
        [first.clone(), second.clone()],
    ))
}
