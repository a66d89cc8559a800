//! ASDU (Application Service Data Unit) header codec.
//!
//! The server treats information objects as opaque bytes; only the ASDU
//! header and the leading object of command ASDUs are interpreted, which
//! is what the built-in dispatch (interrogation, clock sync, ...) needs.
//! Everything else is the application's business.

use bytes::{BufMut, BytesMut};

use crate::Error;

/// Cause-of-transmission values used by the server itself.
pub mod cot {
    pub const SPONTANEOUS: u8 = 3;
    pub const REQUEST: u8 = 5;
    pub const ACTIVATION: u8 = 6;
    pub const ACTIVATION_CON: u8 = 7;
    pub const DEACTIVATION: u8 = 8;
    pub const ACTIVATION_TERMINATION: u8 = 10;
    pub const UNKNOWN_TYPE_ID: u8 = 44;
    pub const UNKNOWN_COT: u8 = 45;
}

/// Type identifications with built-in handling.
pub mod type_id {
    /// C_IC_NA_1 - interrogation command
    pub const C_IC_NA_1: u8 = 100;
    /// C_CI_NA_1 - counter interrogation command
    pub const C_CI_NA_1: u8 = 101;
    /// C_RD_NA_1 - read command
    pub const C_RD_NA_1: u8 = 102;
    /// C_CS_NA_1 - clock synchronization command
    pub const C_CS_NA_1: u8 = 103;
    /// C_TS_NA_1 - test command
    pub const C_TS_NA_1: u8 = 104;
    /// C_RP_NA_1 - reset process command
    pub const C_RP_NA_1: u8 = 105;
    /// C_CD_NA_1 - delay acquisition command
    pub const C_CD_NA_1: u8 = 106;
}

/// Application layer encoding parameters.
///
/// The field sizes fix the ASDU header layout. The defaults are the
/// companion-standard values for 104; deviating sizes exist for 101
/// interoperability and are honoured by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppLayerParameters {
    pub size_of_type_id: u8,
    pub size_of_vsq: u8,
    /// 1 or 2; with 2 the second byte is the originator address.
    pub size_of_cot: u8,
    pub originator_address: u8,
    /// Common address size, 1 or 2 bytes.
    pub size_of_ca: u8,
    /// Information object address size, 1 to 3 bytes.
    pub size_of_ioa: u8,
    pub max_size_of_asdu: u16,
}

impl Default for AppLayerParameters {
    fn default() -> Self {
        Self {
            size_of_type_id: 1,
            size_of_vsq: 1,
            size_of_cot: 2,
            originator_address: 0,
            size_of_ca: 2,
            size_of_ioa: 3,
            max_size_of_asdu: 249,
        }
    }
}

impl AppLayerParameters {
    fn header_size(&self) -> usize {
        (self.size_of_type_id + self.size_of_vsq + self.size_of_cot + self.size_of_ca) as usize
    }
}

/// A seven-octet binary time (CP56Time2a).
///
/// Carried through the clock synchronization path verbatim; field
/// accessors cover what log output and handlers commonly need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cp56Time2a([u8; 7]);

impl Cp56Time2a {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 7 {
            return None;
        }

        let mut octets = [0u8; 7];
        octets.copy_from_slice(&bytes[..7]);
        Some(Self(octets))
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }

    /// Milliseconds within the minute (0..59999).
    pub fn millisecond(&self) -> u16 {
        self.0[0] as u16 | ((self.0[1] as u16) << 8)
    }

    pub fn minute(&self) -> u8 {
        self.0[2] & 0x3f
    }

    pub fn is_invalid(&self) -> bool {
        self.0[2] & 0x80 != 0
    }

    pub fn hour(&self) -> u8 {
        self.0[3] & 0x1f
    }

    pub fn day_of_month(&self) -> u8 {
        self.0[4] & 0x1f
    }

    pub fn month(&self) -> u8 {
        self.0[5] & 0x0f
    }

    /// Two-digit year (0..99).
    pub fn year(&self) -> u8 {
        self.0[6] & 0x7f
    }
}

/// An ASDU: typed header plus raw information object bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asdu {
    type_id: u8,
    vsq: u8,
    cot: u8,
    is_test: bool,
    is_negative: bool,
    originator: u8,
    common_address: u16,
    payload: Vec<u8>,
}

impl Asdu {
    /// A new ASDU with no information objects yet.
    pub fn new(type_id: u8, cot: u8, common_address: u16) -> Self {
        Self {
            type_id,
            vsq: 0,
            cot,
            is_test: false,
            is_negative: false,
            originator: 0,
            common_address,
            payload: Vec::new(),
        }
    }

    /// Parses an ASDU according to `params`. The payload is copied.
    pub fn from_bytes(params: &AppLayerParameters, bytes: &[u8]) -> Result<Self, Error> {
        let header_size = params.header_size();

        if bytes.len() < header_size {
            return Err(Error::MalformedAsdu("truncated header"));
        }

        let type_id = bytes[0];
        let vsq = bytes[1];

        let cot_byte = bytes[2];
        let cot = cot_byte & 0x3f;
        let is_negative = cot_byte & 0x40 != 0;
        let is_test = cot_byte & 0x80 != 0;

        let mut pos = 3;

        let originator = if params.size_of_cot > 1 {
            let oa = bytes[pos];
            pos += 1;
            oa
        } else {
            0
        };

        let common_address = if params.size_of_ca == 1 {
            let ca = bytes[pos] as u16;
            pos += 1;
            ca
        } else {
            let ca = bytes[pos] as u16 | ((bytes[pos + 1] as u16) << 8);
            pos += 2;
            ca
        };

        Ok(Self {
            type_id,
            vsq,
            cot,
            is_test,
            is_negative,
            originator,
            common_address,
            payload: bytes[pos..].to_vec(),
        })
    }

    /// Encodes the ASDU. Fails when the result would exceed
    /// `params.max_size_of_asdu`.
    pub fn encode(&self, params: &AppLayerParameters) -> Result<Vec<u8>, Error> {
        let size = params.header_size() + self.payload.len();

        if size > params.max_size_of_asdu as usize {
            return Err(Error::AsduTooLarge {
                size,
                max: params.max_size_of_asdu as usize,
            });
        }

        let mut buffer = BytesMut::with_capacity(size);

        buffer.put_u8(self.type_id);
        buffer.put_u8(self.vsq);

        let mut cot_byte = self.cot & 0x3f;
        if self.is_negative {
            cot_byte |= 0x40;
        }
        if self.is_test {
            cot_byte |= 0x80;
        }
        buffer.put_u8(cot_byte);

        if params.size_of_cot > 1 {
            buffer.put_u8(self.originator);
        }

        if params.size_of_ca == 1 {
            buffer.put_u8(self.common_address as u8);
        } else {
            buffer.put_u8(self.common_address as u8);
            buffer.put_u8((self.common_address >> 8) as u8);
        }

        buffer.put_slice(&self.payload);

        Ok(buffer.to_vec())
    }

    pub fn type_id(&self) -> u8 {
        self.type_id
    }

    pub fn cot(&self) -> u8 {
        self.cot
    }

    pub fn set_cot(&mut self, cot: u8) {
        self.cot = cot & 0x3f;
    }

    pub fn is_negative(&self) -> bool {
        self.is_negative
    }

    pub fn set_negative(&mut self, negative: bool) {
        self.is_negative = negative;
    }

    pub fn is_test(&self) -> bool {
        self.is_test
    }

    pub fn set_test(&mut self, test: bool) {
        self.is_test = test;
    }

    pub fn originator(&self) -> u8 {
        self.originator
    }

    pub fn set_originator(&mut self, originator: u8) {
        self.originator = originator;
    }

    pub fn common_address(&self) -> u16 {
        self.common_address
    }

    /// VSQ object count (low seven bits).
    pub fn element_count(&self) -> u8 {
        self.vsq & 0x7f
    }

    pub fn is_sequence(&self) -> bool {
        self.vsq & 0x80 != 0
    }

    /// Raw information object bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Appends one information object given as raw bytes (address
    /// included) and bumps the VSQ count.
    pub fn add_information_object_raw(&mut self, object: &[u8]) {
        self.payload.extend_from_slice(object);
        self.vsq = (self.vsq & 0x80) | ((self.element_count() + 1) & 0x7f);
    }

    /// Address of the first information object.
    pub fn first_object_address(&self, params: &AppLayerParameters) -> Option<u32> {
        let ioa_size = params.size_of_ioa as usize;

        if self.payload.len() < ioa_size {
            return None;
        }

        let mut address = 0u32;
        for (i, byte) in self.payload[..ioa_size].iter().enumerate() {
            address |= (*byte as u32) << (8 * i);
        }

        Some(address)
    }

    /// Bytes of the first information object past its address.
    pub fn first_element(&self, params: &AppLayerParameters) -> Option<&[u8]> {
        let ioa_size = params.size_of_ioa as usize;

        if self.payload.len() <= ioa_size {
            return None;
        }

        Some(&self.payload[ioa_size..])
    }
}

/// Encodes an object address into `size_of_ioa` little-endian bytes.
pub fn encode_object_address(params: &AppLayerParameters, address: u32, out: &mut Vec<u8>) {
    for i in 0..params.size_of_ioa as usize {
        out.push((address >> (8 * i)) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let params = AppLayerParameters::default();

        let mut asdu = Asdu::new(type_id::C_IC_NA_1, cot::ACTIVATION, 0x0102);
        asdu.set_originator(7);
        asdu.add_information_object_raw(&[0x00, 0x00, 0x00, 0x14]);

        let bytes = asdu.encode(&params).unwrap();
        assert_eq!(
            bytes,
            vec![100, 0x01, 0x06, 0x07, 0x02, 0x01, 0x00, 0x00, 0x00, 0x14]
        );

        let decoded = Asdu::from_bytes(&params, &bytes).unwrap();
        assert_eq!(decoded, asdu);
        assert_eq!(decoded.first_object_address(&params), Some(0));
        assert_eq!(decoded.first_element(&params), Some(&[0x14][..]));
    }

    #[test]
    fn negative_and_test_flags() {
        let params = AppLayerParameters::default();

        let mut asdu = Asdu::new(type_id::C_TS_NA_1, cot::ACTIVATION, 1);
        asdu.set_negative(true);
        asdu.set_test(true);

        let bytes = asdu.encode(&params).unwrap();
        assert_eq!(bytes[2], 0x06 | 0x40 | 0x80);

        let decoded = Asdu::from_bytes(&params, &bytes).unwrap();
        assert!(decoded.is_negative());
        assert!(decoded.is_test());
        assert_eq!(decoded.cot(), cot::ACTIVATION);
    }

    #[test]
    fn single_byte_field_sizes() {
        let params = AppLayerParameters {
            size_of_cot: 1,
            size_of_ca: 1,
            size_of_ioa: 2,
            ..Default::default()
        };

        let mut asdu = Asdu::new(1, cot::SPONTANEOUS, 0xab);
        asdu.add_information_object_raw(&[0x34, 0x12, 0x01]);

        let bytes = asdu.encode(&params).unwrap();
        assert_eq!(bytes, vec![1, 0x01, 0x03, 0xab, 0x34, 0x12, 0x01]);

        let decoded = Asdu::from_bytes(&params, &bytes).unwrap();
        assert_eq!(decoded.common_address(), 0xab);
        assert_eq!(decoded.originator(), 0);
        assert_eq!(decoded.first_object_address(&params), Some(0x1234));
    }

    #[test]
    fn oversized_asdu_is_refused() {
        let params = AppLayerParameters::default();

        let mut asdu = Asdu::new(1, cot::SPONTANEOUS, 1);
        asdu.add_information_object_raw(&vec![0u8; 250]);

        assert!(matches!(
            asdu.encode(&params),
            Err(Error::AsduTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let params = AppLayerParameters::default();

        assert!(Asdu::from_bytes(&params, &[100, 0x01, 0x06]).is_err());
    }

    #[test]
    fn cp56_fields() {
        // 2024-06-15 12:34:56.789
        let time = Cp56Time2a::from_bytes(&[0xd5, 0xdd, 0x22, 0x0c, 0x0f, 0x06, 0x18]).unwrap();

        assert_eq!(time.millisecond(), 56789);
        assert_eq!(time.minute(), 34);
        assert_eq!(time.hour(), 12);
        assert_eq!(time.day_of_month(), 15);
        assert_eq!(time.month(), 6);
        assert_eq!(time.year(), 24);
        assert!(!time.is_invalid());
    }
}
