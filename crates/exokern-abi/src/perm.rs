//! Page permissions
//!
//! `PagePerm` is the only permission type the kernel accepts from user
//! space. Its constructor enforces the closed bit-set: PRESENT and USER are
//! mandatory, WRITABLE / AVAIL / SHARE / COW are optional, anything else is
//! rejected. Code holding a `PagePerm` never re-checks bits.

use bitflags::bitflags;

use crate::error::SysError;

bitflags! {
    /// Page-table entry bits visible through the syscall interface
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Free software bit, no kernel meaning
        const AVAIL = 1 << 9;
        /// Mapping is shared verbatim across fork
        const SHARE = 1 << 10;
        /// Copy-on-write: read-only until the fault handler copies it
        const COW = 1 << 11;
    }
}

bitflags! {
    /// Page-fault error code pushed by the CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// Protection violation (clear: page not present)
        const PROTECTION = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Validated page permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PagePerm(PteFlags);

impl PagePerm {
    pub const MANDATORY: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);

    /// Present, user, read-only
    pub const USER_RO: PagePerm = PagePerm(Self::MANDATORY);
    /// Present, user, writable
    pub const USER_RW: PagePerm = PagePerm(Self::MANDATORY.union(PteFlags::WRITABLE));

    pub fn new(flags: PteFlags) -> Option<Self> {
        if flags.contains(Self::MANDATORY) {
            Some(PagePerm(flags))
        } else {
            None
        }
    }

    /// Decode a raw syscall argument.
    pub fn from_bits(bits: u64) -> Result<Self, SysError> {
        PteFlags::from_bits(bits)
            .and_then(Self::new)
            .ok_or(SysError::InvalidArg)
    }

    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    pub const fn flags(self) -> PteFlags {
        self.0
    }

    pub const fn is_writable(self) -> bool {
        self.0.contains(PteFlags::WRITABLE)
    }

    pub const fn is_cow(self) -> bool {
        self.0.contains(PteFlags::COW)
    }

    pub const fn is_shared(self) -> bool {
        self.0.contains(PteFlags::SHARE)
    }

    pub fn with(self, flags: PteFlags) -> Self {
        PagePerm(self.0 | flags)
    }

    /// Clear optional bits; the mandatory pair always survives.
    pub fn without(self, flags: PteFlags) -> Self {
        PagePerm((self.0 - flags) | Self::MANDATORY)
    }

    /// The copy-on-write form of this mapping.
    pub fn to_cow(self) -> Self {
        self.without(PteFlags::WRITABLE).with(PteFlags::COW)
    }

    /// May a mapping with `self` be aliased with `requested`?
    pub const fn permits(self, requested: PagePerm) -> bool {
        self.is_writable() || !requested.is_writable()
    }
}

impl From<PagePerm> for u64 {
    fn from(perm: PagePerm) -> u64 {
        perm.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mandatory_bits_required() {
        assert_eq!(PagePerm::from_bits(0b101).map(|p| p.bits()), Ok(0b101));
        assert_eq!(PagePerm::from_bits(0b001), Err(SysError::InvalidArg));
        assert_eq!(PagePerm::from_bits(0b100), Err(SysError::InvalidArg));
        assert_eq!(PagePerm::from_bits(0), Err(SysError::InvalidArg));
    }

    #[test]
    fn test_cow_form_drops_write() {
        let perm = PagePerm::USER_RW.with(PteFlags::AVAIL);
        let cow = perm.to_cow();
        assert!(cow.is_cow());
        assert!(!cow.is_writable());
        assert!(cow.flags().contains(PteFlags::AVAIL));
    }

    #[test]
    fn test_without_keeps_mandatory() {
        let perm = PagePerm::USER_RW.without(PteFlags::all());
        assert_eq!(perm, PagePerm::USER_RO);
    }

    #[test]
    fn test_permits_write_only_from_writable() {
        assert!(PagePerm::USER_RW.permits(PagePerm::USER_RW));
        assert!(PagePerm::USER_RO.permits(PagePerm::USER_RO));
        assert!(!PagePerm::USER_RO.permits(PagePerm::USER_RW));
        assert!(!PagePerm::USER_RO.to_cow().permits(PagePerm::USER_RW));
    }

    proptest! {
        #[test]
        fn prop_foreign_bits_rejected(bits in any::<u64>()) {
            let foreign = bits & !PteFlags::all().bits();
            prop_assume!(foreign != 0);
            prop_assert_eq!(PagePerm::from_bits(bits | 0b101), Err(SysError::InvalidArg));
        }

        #[test]
        fn prop_valid_bits_roundtrip(optional in 0u64..16) {
            let mut bits = PagePerm::MANDATORY.bits();
            if optional & 1 != 0 { bits |= PteFlags::WRITABLE.bits(); }
            if optional & 2 != 0 { bits |= PteFlags::AVAIL.bits(); }
            if optional & 4 != 0 { bits |= PteFlags::SHARE.bits(); }
            if optional & 8 != 0 { bits |= PteFlags::COW.bits(); }
            prop_assert_eq!(PagePerm::from_bits(bits).map(PagePerm::bits), Ok(bits));
        }
    }
}
