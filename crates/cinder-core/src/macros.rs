/// Declares a `#[repr(u32)]` enum together with its raw conversions.
///
/// Every enum that travels through a record or the command stream goes through
/// `raw()` on the way in and `from_raw()` on the way out.
macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Raw value used in binary records.
            #[inline]
            pub const fn raw(self) -> u32 {
                self as u32
            }

            /// Parse a raw value, returning `None` for unknown values.
            pub const fn from_raw(raw: u32) -> Option<Self> {
                $( if raw == $value { return Some(Self::$variant); } )+
                None
            }
        }
    };
}

pub(crate) use raw_enum;
