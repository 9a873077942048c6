//! A simple way to specify the sizes or offsets of up to three dimensions.

use std::fmt::Debug;
use std::ops::Index;

use num_traits::{Num, ToPrimitive};

use crate::sim::device::LaunchError;

/// Specifies a size or offset in up to three dimensions.
///
/// Dimensions are always specified in order from d0 -> d1 -> d2. The
/// `Unspecified` variant stands in for an argument the caller omitted
/// (a `NULL` offset or local size in OpenCL terms).
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum SpatialDims {
    Unspecified,
    One(usize),
    Two(usize, usize),
    Three(usize, usize, usize),
}

impl SpatialDims {
    /// Returns the number of dimensions defined by this `SpatialDims`.
    pub fn dim_count(&self) -> u32 {
        match *self {
            SpatialDims::Unspecified => 0,
            SpatialDims::One(..) => 1,
            SpatialDims::Two(..) => 2,
            SpatialDims::Three(..) => 3,
        }
    }

    /// Returns a 3D size with unspecified trailing dimensions set to `1`.
    pub fn to_lens(&self) -> [usize; 3] {
        match *self {
            SpatialDims::Unspecified => [1, 1, 1],
            SpatialDims::One(x) => [x, 1, 1],
            SpatialDims::Two(x, y) => [x, y, 1],
            SpatialDims::Three(x, y, z) => [x, y, z],
        }
    }

    /// Returns a 3D offset with unspecified trailing dimensions set to `0`.
    pub fn to_offset(&self) -> [usize; 3] {
        match *self {
            SpatialDims::Unspecified => [0, 0, 0],
            SpatialDims::One(x) => [x, 0, 0],
            SpatialDims::Two(x, y) => [x, y, 0],
            SpatialDims::Three(x, y, z) => [x, y, z],
        }
    }

    /// Returns the product of all contained dimensional values (a length,
    /// area, or volume) or zero if unspecified.
    pub fn to_len(&self) -> usize {
        match *self {
            SpatialDims::Unspecified => 0,
            SpatialDims::One(d0) => d0,
            SpatialDims::Two(d0, d1) => d0 * d1,
            SpatialDims::Three(d0, d1, d2) => d0 * d1 * d2,
        }
    }

    /// Returns `true` if this `SpatialDims` is an `Unspecified` variant.
    pub fn is_unspecified(&self) -> bool {
        matches!(*self, SpatialDims::Unspecified)
    }
}

impl Index<usize> for SpatialDims {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        match *self {
            SpatialDims::Unspecified => &1,
            SpatialDims::One(ref x) => [x, &1, &1][index],
            SpatialDims::Two(ref x, ref y) => [x, y, &1][index],
            SpatialDims::Three(ref x, ref y, ref z) => [x, y, z][index],
        }
    }
}

fn to_usize<T: Num + ToPrimitive + Debug + Copy>(val: T) -> usize {
    val.to_usize().unwrap_or_else(|| {
        panic!("SpatialDims: cannot convert '{:?}' to a non-negative integer", val)
    })
}

impl From<()> for SpatialDims {
    fn from(_: ()) -> SpatialDims {
        SpatialDims::Unspecified
    }
}

impl From<usize> for SpatialDims {
    fn from(val: usize) -> SpatialDims {
        SpatialDims::One(val)
    }
}

impl From<u32> for SpatialDims {
    fn from(val: u32) -> SpatialDims {
        SpatialDims::One(val as usize)
    }
}

impl From<i32> for SpatialDims {
    fn from(val: i32) -> SpatialDims {
        SpatialDims::One(to_usize(val))
    }
}

impl<T: Num + ToPrimitive + Debug + Copy> From<(T,)> for SpatialDims {
    fn from(val: (T,)) -> SpatialDims {
        SpatialDims::One(to_usize(val.0))
    }
}

impl<T: Num + ToPrimitive + Debug + Copy> From<(T, T)> for SpatialDims {
    fn from(val: (T, T)) -> SpatialDims {
        SpatialDims::Two(to_usize(val.0), to_usize(val.1))
    }
}

impl<T: Num + ToPrimitive + Debug + Copy> From<(T, T, T)> for SpatialDims {
    fn from(val: (T, T, T)) -> SpatialDims {
        SpatialDims::Three(to_usize(val.0), to_usize(val.1), to_usize(val.2))
    }
}

impl<T: Num + ToPrimitive + Debug + Copy> From<[T; 1]> for SpatialDims {
    fn from(val: [T; 1]) -> SpatialDims {
        SpatialDims::One(to_usize(val[0]))
    }
}

impl<T: Num + ToPrimitive + Debug + Copy> From<[T; 2]> for SpatialDims {
    fn from(val: [T; 2]) -> SpatialDims {
        SpatialDims::Two(to_usize(val[0]), to_usize(val[1]))
    }
}

impl<T: Num + ToPrimitive + Debug + Copy> From<[T; 3]> for SpatialDims {
    fn from(val: [T; 3]) -> SpatialDims {
        SpatialDims::Three(to_usize(val[0]), to_usize(val[1]), to_usize(val[2]))
    }
}

/// A fully-normalised, validated N-D launch geometry.
///
/// The dispatcher derives one of these from the caller's offset/global/local
/// triple before any work-group exists; every geometry query a work-item can
/// make is answered from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NDRange {
    pub work_dim: u32,
    pub global_offset: [usize; 3],
    pub global_size: [usize; 3],
    pub local_size: [usize; 3],
    pub num_groups: [usize; 3],
}

impl NDRange {
    /// Validates and normalises a launch request.
    ///
    /// `reqd` is the kernel's required work-group size, zero meaning
    /// unconstrained per dimension. Fails with
    /// [`LaunchError::InvalidWorkSize`] when a local size is zero or does not
    /// divide the global size, or when it violates the required size.
    pub fn new(
        reqd: [usize; 3],
        offset: SpatialDims,
        global: SpatialDims,
        local: SpatialDims,
    ) -> Result<NDRange, LaunchError> {
        if global.is_unspecified() {
            return Err(LaunchError::NoGlobalWorkSize);
        }

        let work_dim = global.dim_count();
        let global_size = global.to_lens();
        let global_offset = offset.to_offset();
        let local_size = local.to_lens();

        let invalid = |reason: String| LaunchError::InvalidWorkSize {
            reason,
            global: global_size,
            local: local_size,
        };

        let mut num_groups = [1; 3];
        for d in 0..3 {
            if global_size[d] == 0 {
                return Err(invalid(format!("global size is zero in dimension {}", d)));
            }
            if local_size[d] == 0 {
                return Err(invalid(format!("local size is zero in dimension {}", d)));
            }
            if global_size[d] % local_size[d] != 0 {
                return Err(invalid(format!(
                    "local size {} does not divide global size {} in dimension {}",
                    local_size[d], global_size[d], d
                )));
            }
            if reqd[d] != 0 && local_size[d] != reqd[d] {
                return Err(invalid(format!(
                    "kernel requires a work-group size of {} in dimension {}, got {}",
                    reqd[d], d, local_size[d]
                )));
            }
            num_groups[d] = global_size[d] / local_size[d];
        }

        Ok(NDRange {
            work_dim,
            global_offset,
            global_size,
            local_size,
            num_groups,
        })
    }

    /// Total number of work-groups.
    pub fn group_count(&self) -> usize {
        self.num_groups[0] * self.num_groups[1] * self.num_groups[2]
    }

    /// Number of work-items per group.
    pub fn group_len(&self) -> usize {
        self.local_size[0] * self.local_size[1] * self.local_size[2]
    }
}
