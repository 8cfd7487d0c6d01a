//! MPEG transport stream muxer (spec §4.6).
//!
//! Fixed PID plan: PAT on PID 0x0000, PMT on PID 0x1000, SDT on PID 0x0011,
//! elementary streams starting at PID 0x0100. The first stream added
//! carries the PCR. PAT is re-sent every [`PAT_REPEAT_PACKETS`] TS packets
//! and SDT every [`SDT_REPEAT_PACKETS`], matching common broadcast cadences
//! so late-joining decoders (and packet-loss-tolerant ones) re-acquire the
//! program map without waiting for `start_stream`. Output is batched into
//! groups of [`BATCH_SIZE`] 188-byte packets, the usual UDP/SRT payload
//! alignment for MPEG-TS (7 * 188 = 1316 bytes).

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{StreamError, StreamResult};
use crate::types::{AudioCodec, Codec, CodecConfig, Frame, MediaKind, Packet, StreamId, VideoCodec};

use super::StreamIdAllocator;

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const SDT_PID: u16 = 0x0011;
const FIRST_ELEMENTARY_PID: u16 = 0x0100;
const PAT_REPEAT_PACKETS: u32 = 40;
const SDT_REPEAT_PACKETS: u32 = 200;
const BATCH_SIZE: usize = 7;

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn ts_stream_type(codec: Codec) -> StreamResult<u8> {
    match codec {
        Codec::Video(VideoCodec::H264) => Ok(0x1B),
        Codec::Video(VideoCodec::H265) => Ok(0x24),
        Codec::Audio(AudioCodec::Aac) => Ok(0x0F),
        other => Err(StreamError::unsupported(format!(
            "{other:?} is not carried by MPEG-TS"
        ))),
    }
}

struct TsStream {
    pid: u16,
    codec: Codec,
    stream_type: u8,
    continuity: u8,
}

/// MPEG transport stream muxer.
pub struct TsMuxer {
    streams: HashMap<StreamId, TsStream>,
    allocator: StreamIdAllocator,
    next_pid: u16,
    pcr_pid: Option<u16>,
    pat_continuity: u8,
    pmt_continuity: u8,
    sdt_continuity: u8,
    packets_since_pat: u32,
    packets_since_sdt: u32,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            allocator: StreamIdAllocator::default(),
            next_pid: FIRST_ELEMENTARY_PID,
            pcr_pid: None,
            pat_continuity: 0,
            pmt_continuity: 0,
            sdt_continuity: 0,
            packets_since_pat: PAT_REPEAT_PACKETS,
            packets_since_sdt: SDT_REPEAT_PACKETS,
        }
    }

    fn pmt_entries(&self) -> Vec<(u16, u8)> {
        let mut entries: Vec<_> = self
            .streams
            .values()
            .map(|s| (s.pid, s.stream_type))
            .collect();
        entries.sort_by_key(|(pid, _)| *pid);
        entries
    }

    fn psi_packets(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        if self.packets_since_pat >= PAT_REPEAT_PACKETS {
            out.push(build_psi_packet(
                PAT_PID,
                &mut self.pat_continuity,
                build_pat_section(PMT_PID),
            ));
            out.push(build_psi_packet(
                PMT_PID,
                &mut self.pmt_continuity,
                build_pmt_section(self.pcr_pid.unwrap_or(FIRST_ELEMENTARY_PID), &self.pmt_entries()),
            ));
            self.packets_since_pat = 0;
        }
        if self.packets_since_sdt >= SDT_REPEAT_PACKETS {
            out.push(build_psi_packet(SDT_PID, &mut self.sdt_continuity, build_sdt_section()));
            self.packets_since_sdt = 0;
        }
        out.into_iter()
            .map(|raw| to_packet(vec![raw], true, true))
            .collect()
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Muxer for TsMuxer {
    fn add_stream(&mut self, config: &CodecConfig) -> StreamResult<StreamId> {
        let stream_type = ts_stream_type(config.codec)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        if self.pcr_pid.is_none() {
            self.pcr_pid = Some(pid);
        }
        let id = self.allocator.next();
        self.streams.insert(
            id,
            TsStream {
                pid,
                codec: config.codec,
                stream_type,
                continuity: 0,
            },
        );
        Ok(id)
    }

    fn remove_stream(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.remove(&id) {
            if self.pcr_pid == Some(stream.pid) {
                self.pcr_pid = self.streams.values().map(|s| s.pid).min();
            }
        }
    }

    fn start_stream(&mut self) -> StreamResult<Vec<Packet>> {
        self.packets_since_pat = PAT_REPEAT_PACKETS;
        self.packets_since_sdt = SDT_REPEAT_PACKETS;
        Ok(self.psi_packets())
    }

    fn write(&mut self, id: StreamId, frame: Frame) -> StreamResult<Vec<Packet>> {
        let is_pcr_stream = self.streams.get(&id).map(|s| Some(s.pid) == self.pcr_pid).unwrap_or(false);
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| StreamError::config("unknown stream id"))?;

        let mut payload = BytesMut::new();
        if stream.codec.kind() == MediaKind::Video && frame.is_key_frame {
            for unit in &frame.csd {
                payload.put_slice(&[0, 0, 0, 1]);
                payload.put_slice(unit);
            }
        }
        payload.put_slice(&frame.data);

        let pes_stream_id = match stream.codec.kind() {
            MediaKind::Video => 0xE0,
            MediaKind::Audio => 0xC0,
        };
        let pes = build_pes_packet(pes_stream_id, frame.pts_us, frame.dts_us, &payload);

        let pcr = is_pcr_stream.then(|| pcr_from_pts_us(frame.pts_us));
        let mut out = self.psi_packets();
        let ts_packets = packetize_pes(stream.pid, &mut stream.continuity, &pes, pcr);
        self.packets_since_pat += ts_packets.len() as u32;
        self.packets_since_sdt += ts_packets.len() as u32;

        for (i, batch) in ts_packets.chunks(BATCH_SIZE).enumerate() {
            out.push(to_packet(
                batch.to_vec(),
                i == 0,
                (i + 1) * BATCH_SIZE >= ts_packets.len(),
            ));
        }
        Ok(out)
    }

    fn stop_stream(&mut self) -> StreamResult<Vec<Packet>> {
        Ok(Vec::new())
    }
}

fn to_packet(ts_packets: Vec<[u8; TS_PACKET_SIZE]>, first: bool, last: bool) -> Packet {
    let mut data = BytesMut::with_capacity(ts_packets.len() * TS_PACKET_SIZE);
    for packet in ts_packets {
        data.put_slice(&packet);
    }
    Packet {
        data: data.freeze(),
        is_first_of_frame: first,
        is_last_of_frame: last,
        timestamp_us: 0,
    }
}

fn pcr_from_pts_us(pts_us: i64) -> (u64, u16) {
    let ticks_27mhz = (pts_us as i128 * 27) as i128; // 27 MHz clock, 27 ticks/us
    let base = (ticks_27mhz / 300) as u64 & 0x1_FFFF_FFFF;
    let ext = (ticks_27mhz % 300) as u16 & 0x1FF;
    (base, ext)
}

fn encode_pcr(base: u64, ext: u16) -> [u8; 6] {
    let mut out = [0u8; 6];
    let base_shifted = base << 15;
    out[0] = (base_shifted >> 32) as u8;
    out[1] = (base_shifted >> 24) as u8;
    out[2] = (base_shifted >> 16) as u8;
    out[3] = (base_shifted >> 8) as u8;
    out[4] = (base_shifted as u8) | 0x7E | ((ext >> 8) as u8 & 0x01);
    out[5] = (ext & 0xFF) as u8;
    out
}

fn encode_timestamp(marker: u8, ts_90khz: u64) -> [u8; 5] {
    let ts = ts_90khz & 0x1_FFFF_FFFF;
    [
        (marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1,
        ((ts >> 22) & 0xFF) as u8,
        (((ts >> 15) & 0x7F) as u8) << 1 | 1,
        ((ts >> 7) & 0xFF) as u8,
        ((ts & 0x7F) as u8) << 1 | 1,
    ]
}

fn to_90khz(us: i64) -> u64 {
    ((us as i128 * 9) / 100) as u64
}

fn build_pes_packet(stream_id: u8, pts_us: i64, dts_us: Option<i64>, payload: &[u8]) -> Vec<u8> {
    let mut pes = Vec::with_capacity(payload.len() + 19);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);

    let has_dts = dts_us.is_some();
    let header_data_len: u8 = if has_dts { 10 } else { 5 };
    let optional_len = 3 + header_data_len as usize;
    let pes_packet_length = payload.len() + optional_len;
    if pes_packet_length <= 0xFFFF {
        pes.extend_from_slice(&(pes_packet_length as u16).to_be_bytes());
    } else {
        pes.extend_from_slice(&[0x00, 0x00]); // unbounded, permitted for video
    }

    pes.push(0x80);
    let pts_dts_flags = if has_dts { 0b11 } else { 0b10 };
    pes.push((pts_dts_flags << 6) as u8);
    pes.push(header_data_len);

    let pts_marker = if has_dts { 0b0011 } else { 0b0010 };
    pes.extend_from_slice(&encode_timestamp(pts_marker, to_90khz(pts_us)));
    if let Some(dts_us) = dts_us {
        pes.extend_from_slice(&encode_timestamp(0b0001, to_90khz(dts_us)));
    }

    pes.extend_from_slice(payload);
    pes
}

/// Splits a PES packet into 188-byte TS packets, inserting a PCR adaptation
/// field on the first packet when `pcr` is set.
fn packetize_pes(
    pid: u16,
    continuity: &mut u8,
    pes: &[u8],
    pcr: Option<(u64, u16)>,
) -> Vec<[u8; TS_PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut first = true;

    while offset < pes.len() || first {
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1F);
        packet[2] = (pid & 0xFF) as u8;

        let mut header_len = 4;
        let has_pcr = first && pcr.is_some();
        let remaining = pes.len() - offset;
        let max_payload = TS_PACKET_SIZE - header_len - if has_pcr { 8 } else { 0 };
        let needs_padding = remaining < max_payload;

        if has_pcr || needs_padding {
            let adaptation_len_pos = header_len;
            header_len += 1; // adaptation_field_length byte itself
            let mut adaptation_flags = 0x00u8;
            let mut adaptation_body = Vec::new();
            if has_pcr {
                adaptation_flags |= 0x10;
                let (base, ext) = pcr.unwrap();
                adaptation_body.extend_from_slice(&encode_pcr(base, ext));
            }
            let available_for_payload = TS_PACKET_SIZE - header_len - 1 - adaptation_body.len();
            let payload_len = remaining.min(available_for_payload);
            let stuffing = available_for_payload - payload_len;
            let adaptation_field_length = 1 + adaptation_body.len() + stuffing;

            packet[adaptation_len_pos] = adaptation_field_length as u8;
            packet[adaptation_len_pos + 1] = adaptation_flags;
            let mut cursor = adaptation_len_pos + 2;
            packet[cursor..cursor + adaptation_body.len()].copy_from_slice(&adaptation_body);
            cursor += adaptation_body.len();
            for b in &mut packet[cursor..cursor + stuffing] {
                *b = 0xFF;
            }
            header_len = adaptation_len_pos + 1 + adaptation_field_length;
            packet[3] = 0x30 | (*continuity & 0x0F);
        } else {
            packet[3] = 0x10 | (*continuity & 0x0F);
        }
        *continuity = continuity.wrapping_add(1) & 0x0F;

        let payload_len = (TS_PACKET_SIZE - header_len).min(remaining);
        packet[header_len..header_len + payload_len]
            .copy_from_slice(&pes[offset..offset + payload_len]);
        offset += payload_len;
        first = false;
        packets.push(packet);

        if offset >= pes.len() {
            break;
        }
    }
    packets
}

fn build_pat_section(pmt_pid: u16) -> [u8; TS_PACKET_SIZE] {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
    payload.push(0xC1); // reserved(2)=11, version(5)=0, current_next=1
    payload.push(0x00); // section_number
    payload.push(0x00); // last_section_number
    payload.extend_from_slice(&[0x00, 0x01]); // program_number = 1
    payload.extend_from_slice(&(0xE000 | pmt_pid).to_be_bytes());

    let section_length = payload.len() as u16 + 4;
    let mut section = vec![0x00]; // table_id: PAT
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(&payload);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());

    let mut continuity = 0;
    build_psi_packet(PAT_PID, &mut continuity, section)
}

fn build_pmt_section(pcr_pid: u16, streams: &[(u16, u8)]) -> [u8; TS_PACKET_SIZE] {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x00, 0x01]); // program_number = 1
    payload.push(0xC1);
    payload.push(0x00);
    payload.push(0x00);
    payload.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
    payload.extend_from_slice(&[0xF0, 0x00]); // program_info_length = 0
    for &(pid, stype) in streams {
        payload.push(stype);
        payload.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        payload.extend_from_slice(&[0xF0, 0x00]); // ES_info_length = 0
    }

    let section_length = payload.len() as u16 + 4;
    let mut section = vec![0x02]; // table_id: PMT
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(&payload);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());

    let mut continuity = 0;
    build_psi_packet(PMT_PID, &mut continuity, section)
}

fn build_sdt_section() -> [u8; TS_PACKET_SIZE] {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x00, 0x01]); // transport_stream_id
    payload.push(0xC1);
    payload.push(0x00);
    payload.push(0x00);
    payload.extend_from_slice(&[0x00, 0x01]); // original_network_id
    payload.push(0xFF); // reserved_future_use
    payload.extend_from_slice(&[0x00, 0x01]); // service_id
    payload.push(0xFC); // reserved(6) + EIT_schedule(0) + EIT_present_following(0)
    payload.extend_from_slice(&[0x80, 0x00]); // running_status=4 << 5, free_ca=0, descriptors_length=0

    let section_length = payload.len() as u16 + 4;
    let mut section = vec![0x42]; // table_id: SDT actual
    section.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(&payload);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());

    let mut continuity = 0;
    build_psi_packet(SDT_PID, &mut continuity, section)
}

fn build_psi_packet(pid: u16, continuity: &mut u8, section: Vec<u8>) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // payload_unit_start_indicator
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x10 | (*continuity & 0x0F);
    *continuity = continuity.wrapping_add(1) & 0x0F;
    packet[4] = 0x00; // pointer_field
    let len = section.len().min(TS_PACKET_SIZE - 5);
    packet[5..5 + len].copy_from_slice(&section[..len]);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Muxer as _;
    use crate::types::{AudioSourceConfig, ByteFormat, SourceConfig, VideoSourceConfig};

    fn video_config(codec: VideoCodec) -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Video(VideoSourceConfig {
                width: 1280,
                height: 720,
                fps: 30,
                dynamic_range: crate::types::DynamicRangeProfile::Sdr,
            }),
            codec: Codec::Video(codec),
            bitrate_bps: 2_000_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    fn audio_config() -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Audio(AudioSourceConfig {
                sample_rate: 48_000,
                channels: 2,
                byte_format: ByteFormat::S16Le,
            }),
            codec: Codec::Audio(AudioCodec::Aac),
            bitrate_bps: 128_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    #[test]
    fn crc32_matches_known_vector() {
        // CRC-32/MPEG-2 of ASCII "123456789" is a standard check value.
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn add_stream_rejects_opus_over_ts() {
        let mut muxer = TsMuxer::new();
        let mut cfg = audio_config();
        cfg.codec = Codec::Audio(AudioCodec::Opus);
        let err = muxer.add_stream(&cfg).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unsupported);
    }

    #[test]
    fn start_stream_emits_pat_pmt_with_valid_sync_bytes() {
        let mut muxer = TsMuxer::new();
        muxer.add_stream(&video_config(VideoCodec::H264)).unwrap();
        let packets = muxer.start_stream().unwrap();
        assert!(!packets.is_empty());
        for packet in &packets {
            for chunk in packet.data.chunks(TS_PACKET_SIZE) {
                assert_eq!(chunk[0], SYNC_BYTE);
            }
        }
    }

    #[test]
    fn write_batches_ts_packets_in_groups_of_seven() {
        let mut muxer = TsMuxer::new();
        let video_id = muxer.add_stream(&video_config(VideoCodec::H264)).unwrap();
        muxer.start_stream().unwrap();

        let big_payload = Bytes::from(vec![0xAB; 5000]);
        let frame = Frame::new(
            big_payload,
            0,
            Some(0),
            true,
            vec![Bytes::from_static(b"sps"), Bytes::from_static(b"pps")],
            Codec::Video(VideoCodec::H264),
        )
        .unwrap();

        let packets = muxer.write(video_id, frame).unwrap();
        // Every batch packet's payload is a whole number of 188-byte TS packets.
        for packet in &packets {
            assert_eq!(packet.data.len() % TS_PACKET_SIZE, 0);
            assert!(packet.data.len() / TS_PACKET_SIZE <= BATCH_SIZE);
        }
    }

    #[test]
    fn pcr_round_trips_through_encode() {
        let (base, ext) = pcr_from_pts_us(1_000_000); // 1 second
        let encoded = encode_pcr(base, ext);
        // 27 MHz clock: 1 second = 27_000_000 ticks = base*300 + ext.
        assert_eq!(base * 300 + ext as u64, 27_000_000);
        assert_eq!(encoded.len(), 6);
    }
}
