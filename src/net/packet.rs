// Time packet wire format
// Two big-endian u64 timestamps, 16 bytes, no header or checksum.

use crate::error::SyncError;

/// A single probe/reply exchanged with a time provider.
///
/// The client fills `local_time` when sending; the provider fills
/// `remote_time` and echoes the packet back unchanged otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimePacket {
    pub local_time: u64,
    pub remote_time: u64,
}

impl TimePacket {
    pub const SIZE: usize = 16;

    /// Create a probe stamped with the sender's clock.
    pub fn new(local_time: u64) -> Self {
        TimePacket {
            local_time,
            remote_time: 0,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.local_time.to_be_bytes());
        buf[8..16].copy_from_slice(&self.remote_time.to_be_bytes());
        buf
    }

    /// Decode the first 16 bytes of `data`; trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        if data.len() < Self::SIZE {
            return Err(SyncError::MalformedPacket {
                len: data.len(),
                expected: Self::SIZE,
            });
        }
        let mut local = [0u8; 8];
        let mut remote = [0u8; 8];
        local.copy_from_slice(&data[0..8]);
        remote.copy_from_slice(&data[8..16]);
        Ok(TimePacket {
            local_time: u64::from_be_bytes(local),
            remote_time: u64::from_be_bytes(remote),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let pkt = TimePacket {
            local_time: 0x0102030405060708,
            remote_time: 0x1112131415161718,
        };
        let bytes = pkt.encode();
        assert_eq!(hex::encode(bytes), "01020304050607081112131415161718");
    }

    #[test]
    fn test_round_trip_extremes() {
        for pkt in [
            TimePacket::default(),
            TimePacket { local_time: u64::MAX, remote_time: 1 },
            TimePacket { local_time: 42, remote_time: u64::MAX },
        ] {
            assert_eq!(TimePacket::decode(&pkt.encode()).unwrap(), pkt);
        }
    }

    #[test]
    fn test_decode_short_packet() {
        let err = TimePacket::decode(&[0u8; 15]).unwrap_err();
        match err {
            SyncError::MalformedPacket { len, expected } => {
                assert_eq!(len, 15);
                assert_eq!(expected, 16);
            }
            other => panic!("Expected MalformedPacket, got {:?}", other),
        }
        assert!(TimePacket::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut data = TimePacket { local_time: 7, remote_time: 9 }.encode().to_vec();
        data.extend_from_slice(&[0xff; 4]);
        let pkt = TimePacket::decode(&data).unwrap();
        assert_eq!(pkt.local_time, 7);
        assert_eq!(pkt.remote_time, 9);
    }

    #[test]
    fn test_new_probe_has_no_remote_time() {
        let pkt = TimePacket::new(1234);
        assert_eq!(pkt.local_time, 1234);
        assert_eq!(pkt.remote_time, 0);
    }
}
