//! Per-entity changed-field flag sets.
//!
//! Each bit names one semantic sub-part of an object. The union of set bits is
//! what the next push serializes.

use bitflags::bitflags;

use super::ObjectType;

/// Common view over the typed flag sets, used by generic sync code.
pub trait FieldMask: Copy + Eq + std::fmt::Debug + Send + Sync {
    /// Every bit the object type knows about.
    const EVERYTHING: Self;

    fn bits(self) -> u32;
    fn from_bits_truncate(bits: u32) -> Self;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CollectionChanges: u32 {
        const NAME = 1 << 0;
        const PARENT = 1 << 1;
        const TRASH = 1 << 2;
        const RELATIONS = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SearchChanges: u32 {
        const NAME = 1 << 0;
        const CONDITIONS = 1 << 1;
        const TRASH = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ItemChanges: u32 {
        const TYPE = 1 << 0;
        const FIELDS = 1 << 1;
        const CREATORS = 1 << 2;
        const TAGS = 1 << 3;
        const COLLECTIONS = 1 << 4;
        const PARENT = 1 << 5;
        const TRASH = 1 << 6;
        const RELATIONS = 1 << 7;
        const GEOMETRY = 1 << 8;
    }
}

macro_rules! impl_field_mask {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FieldMask for $ty {
                const EVERYTHING: Self = Self::all();

                fn bits(self) -> u32 {
                    <$ty>::bits(&self)
                }

                fn from_bits_truncate(bits: u32) -> Self {
                    <$ty>::from_bits_truncate(bits)
                }
            }
        )*
    };
}

impl_field_mask!(CollectionChanges, SearchChanges, ItemChanges);

/// Every change bit known for the given object type.
#[must_use]
pub fn all_changes(object_type: ObjectType) -> u32 {
    match object_type {
        ObjectType::Collection => CollectionChanges::all().bits(),
        ObjectType::Search => SearchChanges::all().bits(),
        ObjectType::Item => ItemChanges::all().bits(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_bits_do_not_overlap() {
        let mut seen = 0u32;
        for flag in ItemChanges::all().iter() {
            assert_eq!(seen & flag.bits(), 0);
            seen |= flag.bits();
        }
        assert_eq!(seen, ItemChanges::all().bits());
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let mask = <SearchChanges as FieldMask>::from_bits_truncate(0xFFFF);
        assert_eq!(mask, SearchChanges::all());
    }

    #[test]
    fn all_changes_covers_every_flag_of_the_type() {
        assert_eq!(all_changes(ObjectType::Collection), 0b1111);
        assert_eq!(all_changes(ObjectType::Search), 0b111);
        assert_eq!(all_changes(ObjectType::Item), 0x1FF);
        assert_eq!(
            all_changes(ObjectType::Item),
            <ItemChanges as FieldMask>::EVERYTHING.bits()
        );
    }
}
