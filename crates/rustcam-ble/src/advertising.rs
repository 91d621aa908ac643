//! Advertising data builder
//!
//! Builds the legacy AD payload: a sequence of `[len][type][data...]`
//! elements limited to 31 bytes in total.

use smallvec::SmallVec;

use crate::error::{BleError, BleResult};
use crate::protocol::{
    truncate_utf8, AD_FLAG_BR_EDR_NOT_SUPPORTED, AD_FLAG_LE_GENERAL_DISCOVERABLE, AD_TYPE_FLAGS,
    AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_SHORTENED_LOCAL_NAME, MAX_ADV_DATA_LEN,
};
use crate::state::DeviceName;

// ----------------------------------------------------------------------------
// Advertising Payload
// ----------------------------------------------------------------------------

/// Encoded advertising payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisingData {
    bytes: SmallVec<[u8; MAX_ADV_DATA_LEN]>,
}

/// One decoded AD element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdElement<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

impl AdvertisingData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags (LE General Discoverable, BR/EDR Not Supported) followed by the
    /// local name. Names that do not fit are sent as a Shortened Local Name.
    pub fn for_device(name: &DeviceName) -> Self {
        let mut data = Self::new();
        // Flags always fit in an empty payload.
        let _ = data.push(
            AD_TYPE_FLAGS,
            &[AD_FLAG_LE_GENERAL_DISCOVERABLE | AD_FLAG_BR_EDR_NOT_SUPPORTED],
        );

        let room = data.remaining().saturating_sub(2);
        let full = name.as_str();
        let (ad_type, value) = if full.len() <= room {
            (AD_TYPE_COMPLETE_LOCAL_NAME, full)
        } else {
            (AD_TYPE_SHORTENED_LOCAL_NAME, truncate_utf8(full, room))
        };
        let _ = data.push(ad_type, value.as_bytes());
        data
    }

    /// Append one element; fails if the payload would exceed 31 bytes
    pub fn push(&mut self, ad_type: u8, value: &[u8]) -> BleResult<()> {
        let needed = value.len() + 2;
        if needed > self.remaining() {
            return Err(BleError::InvalidArgument(format!(
                "AD element of {} bytes exceeds remaining {} bytes",
                needed,
                self.remaining()
            )));
        }
        self.bytes.push((value.len() + 1) as u8);
        self.bytes.push(ad_type);
        self.bytes.extend_from_slice(value);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        MAX_ADV_DATA_LEN - self.bytes.len()
    }

    /// Iterate over the encoded elements
    pub fn elements(&self) -> AdElements<'_> {
        AdElements { rest: &self.bytes }
    }

    /// Local name carried in the payload, complete or shortened
    pub fn local_name(&self) -> Option<&str> {
        self.elements()
            .find(|e| {
                e.ad_type == AD_TYPE_COMPLETE_LOCAL_NAME || e.ad_type == AD_TYPE_SHORTENED_LOCAL_NAME
            })
            .and_then(|e| std::str::from_utf8(e.data).ok())
    }
}

/// Iterator over `[len][type][data]` elements
pub struct AdElements<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for AdElements<'a> {
    type Item = AdElement<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, tail) = self.rest.split_first()?;
        let len = len as usize;
        if len == 0 || len > tail.len() {
            self.rest = &[];
            return None;
        }
        let (element, rest) = tail.split_at(len);
        self.rest = rest;
        Some(AdElement {
            ad_type: element[0],
            data: &element[1..],
        })
    }
}
