//! Minimal Ogg/Opus stream muxer
//!
//! One Opus packet per page. The stream opens with an `OpusHead` page (BOS) and an
//! `OpusTags` page; audio pages carry the running sample total as granule position.
//! Pages accumulate in an internal buffer until [`OggOpusMuxer::take`] drains them.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Byte offset of the CRC field inside a page header
const CRC_OFFSET: usize = 22;
/// Fixed header length before the segment table
const HEADER_LEN: usize = 27;
const MAX_SEGMENTS: usize = 255;

pub mod header_type {
    pub const CONTINUED: u8 = 0x01;
    pub const BOS: u8 = 0x02;
    pub const EOS: u8 = 0x04;
}

/// Ogg CRC32: polynomial 0x04C11DB7, MSB-first, no reflection, zero init
pub const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04C1_1DB7
            } else {
                r << 1
            };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ b) as usize]
    })
}

/// Lacing values for one complete packet
///
/// A length that is an exact multiple of 255 gets a trailing zero so the packet ends
/// inside this page instead of reading as continued.
pub fn lacing_values(len: usize) -> Result<Vec<u8>, CodecError> {
    let count = len / 255 + 1;
    if count > MAX_SEGMENTS {
        return Err(CodecError::PacketTooLarge(len));
    }
    let mut segments = vec![255u8; count - 1];
    segments.push((len % 255) as u8);
    Ok(segments)
}

/// `OpusHead` identification header
pub fn opus_head(channels: u8, input_sample_rate: u32) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.put_u8(1); // version
    head.put_u8(channels);
    head.put_u16_le(0); // pre-skip
    head.put_u32_le(input_sample_rate);
    head.put_i16_le(0); // output gain
    head.put_u8(0); // mapping family
    head
}

/// `OpusTags` comment header with no user comments
pub fn opus_tags(vendor: &str) -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + vendor.len());
    tags.extend_from_slice(b"OpusTags");
    tags.put_u32_le(vendor.len() as u32);
    tags.extend_from_slice(vendor.as_bytes());
    tags.put_u32_le(0);
    tags
}

/// Serialize one page carrying a single complete packet into `out`
pub fn write_page(
    out: &mut BytesMut,
    header_type: u8,
    granule: u64,
    serial: u32,
    sequence: u32,
    payload: &[u8],
) -> Result<(), CodecError> {
    let segments = lacing_values(payload.len())?;
    let start = out.len();

    out.reserve(HEADER_LEN + segments.len() + payload.len());
    out.put_slice(b"OggS");
    out.put_u8(0); // stream structure version
    out.put_u8(header_type);
    out.put_u64_le(granule);
    out.put_u32_le(serial);
    out.put_u32_le(sequence);
    out.put_u32_le(0); // checksum placeholder
    out.put_u8(segments.len() as u8);
    out.put_slice(&segments);
    out.put_slice(payload);

    let page = &mut out[start..];
    let crc = crc32(page);
    page[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Ogg/Opus muxer for a single logical stream
pub struct OggOpusMuxer {
    pending: BytesMut,
    serial: u32,
    sequence: u32,
    granule: u64,
}

impl OggOpusMuxer {
    /// Start a stream; both header pages are pending immediately
    pub fn new(serial: u32, sample_rate: u32, channels: u8, vendor: &str) -> Result<Self, CodecError> {
        let mut muxer = Self {
            pending: BytesMut::with_capacity(16 * 1024),
            serial,
            sequence: 0,
            granule: 0,
        };
        muxer.page(header_type::BOS, 0, &opus_head(channels, sample_rate))?;
        muxer.page(0, 0, &opus_tags(vendor))?;
        Ok(muxer)
    }

    /// Append one audio packet covering `samples` per-channel samples
    pub fn write_packet(&mut self, packet: &[u8], samples: u64) -> Result<(), CodecError> {
        self.granule += samples;
        self.page(0, self.granule, packet)
    }

    /// Close the logical stream with an empty EOS page
    pub fn finish(&mut self) -> Result<(), CodecError> {
        self.page(header_type::EOS, self.granule, &[])
    }

    fn page(&mut self, header_type: u8, granule: u64, payload: &[u8]) -> Result<(), CodecError> {
        write_page(&mut self.pending, header_type, granule, self.serial, self.sequence, payload)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Drain buffered pages
    pub fn take(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// One parsed page
    #[derive(Debug)]
    pub(crate) struct ParsedPage {
        pub header_type: u8,
        pub granule: u64,
        pub serial: u32,
        pub sequence: u32,
        pub segments: Vec<u8>,
        pub payload: Vec<u8>,
    }

    /// Parse a byte stream into pages, checking capture pattern and CRC of each
    pub(crate) fn parse_pages(mut data: &[u8]) -> Vec<ParsedPage> {
        let mut pages = Vec::new();
        while !data.is_empty() {
            assert!(data.len() >= HEADER_LEN, "truncated page header");
            assert_eq!(&data[..4], b"OggS");
            assert_eq!(data[4], 0);
            let count = data[26] as usize;
            let segments = data[HEADER_LEN..HEADER_LEN + count].to_vec();
            let body_len: usize = segments.iter().map(|&s| s as usize).sum();
            let total = HEADER_LEN + count + body_len;
            assert!(data.len() >= total, "truncated page body");

            let mut page = data[..total].to_vec();
            let stored = u32::from_le_bytes(page[22..26].try_into().unwrap());
            page[22..26].fill(0);
            assert_eq!(crc32(&page), stored, "crc mismatch");

            pages.push(ParsedPage {
                header_type: data[5],
                granule: u64::from_le_bytes(data[6..14].try_into().unwrap()),
                serial: u32::from_le_bytes(data[14..18].try_into().unwrap()),
                sequence: u32::from_le_bytes(data[18..22].try_into().unwrap()),
                segments,
                payload: data[HEADER_LEN + count..total].to_vec(),
            });
            data = &data[total..];
        }
        pages
    }

    #[test]
    fn test_crc_known_vector() {
        // CRC-32/MPEG-2 style without init/xorout: check value for "123456789"
        assert_eq!(crc32(b"123456789"), 0x89A1_897F);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_header_pages() {
        let mut muxer = OggOpusMuxer::new(0xDEAD_BEEF, 48000, 2, "test").unwrap();
        let pages = parse_pages(&muxer.take());
        assert_eq!(pages.len(), 2);

        let head = &pages[0];
        assert_eq!(head.header_type, header_type::BOS);
        assert_eq!(head.sequence, 0);
        assert_eq!(head.serial, 0xDEAD_BEEF);
        assert_eq!(&head.payload[..8], b"OpusHead");
        assert_eq!(head.payload.len(), 19);
        assert_eq!(head.payload[8], 1);
        assert_eq!(head.payload[9], 2);
        assert_eq!(u16::from_le_bytes([head.payload[10], head.payload[11]]), 0);
        assert_eq!(u32::from_le_bytes(head.payload[12..16].try_into().unwrap()), 48000);
        assert_eq!(head.payload[18], 0);

        let tags = &pages[1];
        assert_eq!(tags.header_type, 0);
        assert_eq!(tags.sequence, 1);
        assert_eq!(&tags.payload[..8], b"OpusTags");
        assert_eq!(u32::from_le_bytes(tags.payload[8..12].try_into().unwrap()), 4);
        assert_eq!(&tags.payload[12..16], b"test");
        assert_eq!(&tags.payload[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_granule_accumulates() {
        let mut muxer = OggOpusMuxer::new(1, 48000, 2, "test").unwrap();
        let _ = muxer.take();
        for _ in 0..3 {
            muxer.write_packet(&[0xFC, 0xFF, 0xFE], 1920).unwrap();
        }
        let pages = parse_pages(&muxer.take());
        let granules: Vec<u64> = pages.iter().map(|p| p.granule).collect();
        assert_eq!(granules, vec![1920, 3840, 5760]);
        let sequences: Vec<u32> = pages.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[test]
    fn test_exact_multiple_of_255_terminated() {
        let mut muxer = OggOpusMuxer::new(1, 48000, 2, "test").unwrap();
        let _ = muxer.take();
        muxer.write_packet(&[7u8; 510], 960).unwrap();
        let pages = parse_pages(&muxer.take());
        assert_eq!(pages[0].segments, vec![255, 255, 0]);
        assert_eq!(pages[0].payload.len(), 510);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut out = BytesMut::new();
        let result = write_page(&mut out, 0, 0, 1, 0, &vec![0u8; 255 * 255]);
        assert!(matches!(result, Err(CodecError::PacketTooLarge(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_finish_writes_eos() {
        let mut muxer = OggOpusMuxer::new(1, 48000, 2, "test").unwrap();
        muxer.write_packet(&[1, 2, 3], 480).unwrap();
        muxer.finish().unwrap();
        let pages = parse_pages(&muxer.take());
        let last = pages.last().unwrap();
        assert_eq!(last.header_type, header_type::EOS);
        assert_eq!(last.granule, 480);
        assert_eq!(last.segments, vec![0]);
    }

    proptest! {
        #[test]
        fn prop_pages_parse_and_verify(lengths in proptest::collection::vec(0usize..2000, 1..20)) {
            let mut muxer = OggOpusMuxer::new(42, 48000, 2, "prop").unwrap();
            for (i, len) in lengths.iter().enumerate() {
                let packet: Vec<u8> = (0..*len).map(|b| (b + i) as u8).collect();
                muxer.write_packet(&packet, 960).unwrap();
            }
            let pages = parse_pages(&muxer.take());
            prop_assert_eq!(pages.len(), lengths.len() + 2);
            for (page, len) in pages[2..].iter().zip(&lengths) {
                prop_assert_eq!(page.payload.len(), *len);
                prop_assert!(page.segments.last().map_or(false, |&s| s < 255));
            }
        }

        #[test]
        fn prop_lacing_terminates(len in 0usize..(255 * 254)) {
            let segments = lacing_values(len).unwrap();
            let total: usize = segments.iter().map(|&s| s as usize).sum();
            prop_assert_eq!(total, len);
            prop_assert!(*segments.last().unwrap() < 255);
            if len % 255 == 0 {
                prop_assert_eq!(*segments.last().unwrap(), 0);
            }
        }
    }
}
