use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

/// Memory region permissions.
///
/// Bit values follow `ibv_access_flags`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Permission(u32);

impl Permission {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);

    const REMOTE_MASK: u32 = Self::REMOTE_WRITE.0 | Self::REMOTE_READ.0 | Self::REMOTE_ATOMIC.0;

    /// Check whether all bits of `other` are granted.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any remote access is granted, in which case the
    /// registered region gets a remote key.
    #[inline]
    pub fn has_remote_access(self) -> bool {
        self.0 & Self::REMOTE_MASK != 0
    }

    /// Get the raw bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for Permission {
    /// Allow local write and remote read/write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_READ | Self::REMOTE_WRITE
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::LOCAL_WRITE, "LOCAL_WRITE"),
            (Self::REMOTE_WRITE, "REMOTE_WRITE"),
            (Self::REMOTE_READ, "REMOTE_READ"),
            (Self::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
        ];
        let set = names
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, n)| *n)
            .collect::<Vec<_>>();
        if set.is_empty() {
            write!(f, "Permission(EMPTY)")
        } else {
            write!(f, "Permission({})", set.join(" | "))
        }
    }
}

impl From<Permission> for u32 {
    fn from(p: Permission) -> Self {
        p.0
    }
}

impl Add for Permission {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl AddAssign for Permission {
    fn add_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for Permission {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for Permission {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Permission {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self + rhs
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        *self += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_access_bits() {
        assert!(!Permission::LOCAL_WRITE.has_remote_access());
        assert!(Permission::default().has_remote_access());

        let p = Permission::default() - Permission::REMOTE_WRITE;
        assert!(p.contains(Permission::REMOTE_READ));
        assert!(!p.contains(Permission::REMOTE_WRITE));
        assert_eq!(
            format!("{:?}", p),
            "Permission(LOCAL_WRITE | REMOTE_READ)"
        );
    }
}
