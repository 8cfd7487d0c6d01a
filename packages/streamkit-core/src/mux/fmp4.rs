//! Fragmented MP4 muxer (spec §4.6).
//!
//! The `ftyp` + `moov` header can't be finalized at `start_stream` time: its
//! `stsd` sample entries need each track's decoder config box (`avcC`/
//! `hvcC`/`esds`), and that's only known once a track's first frame carries
//! CSD. So `start_stream` itself emits nothing; the header is built and
//! returned by whichever `write` call first observes CSD for every added
//! track, ahead of that call's own fragment (if any). Every later `write`
//! emits one fragment: `moof` (`mfhd` + one `traf` per stream touched)
//! followed by `mdat`. `trun` flags are derived from which optional fields a
//! given sample actually needs (composition time offset only when `dts !=
//! pts`, sample flags only for video) rather than a fixed template, matching
//! how real encoders keep fragments minimal.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{StreamError, StreamResult};
use crate::types::{Codec, CodecConfig, Frame, MediaKind, Packet, SourceConfig, StreamId};

use super::StreamIdAllocator;

const TIMESCALE: u32 = 1_000_000; // microseconds, matching `pts_us`/`dts_us`

fn bx(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

fn full_box(fourcc: &[u8; 4], version: u8, flags: u32, mut body: Vec<u8>) -> Vec<u8> {
    let mut header = vec![version];
    header.extend_from_slice(&flags.to_be_bytes()[1..]);
    header.append(&mut body);
    bx(fourcc, &header)
}

struct Fmp4Stream {
    track_id: u32,
    codec: Codec,
    config: CodecConfig,
    /// Parameter sets captured off the first frame that carried them
    /// (spec I2 guarantees every audio frame, and every key video frame,
    /// has non-empty CSD). `None` until then.
    csd: Option<Vec<Bytes>>,
}

/// A sample that has been received but not yet flushed to a fragment,
/// because its duration (spec §4.5.2: "tick counts derived from
/// inter-frame timestamps") is only known once the *next* sample on the
/// same track arrives.
struct PendingSample {
    dts_us: i64,
    sample_data: Bytes,
    sample_flags: u32,
    cto: i32,
}

/// Fragmented MP4 muxer.
pub struct FragmentedMp4Muxer {
    streams: HashMap<StreamId, Fmp4Stream>,
    pending: HashMap<StreamId, PendingSample>,
    allocator: StreamIdAllocator,
    next_track_id: u32,
    next_sequence_number: u32,
    header_emitted: bool,
}

impl FragmentedMp4Muxer {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            pending: HashMap::new(),
            allocator: StreamIdAllocator::default(),
            next_track_id: 1,
            next_sequence_number: 1,
            header_emitted: false,
        }
    }

    fn ftyp() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"isom"); // major_brand
        body.extend_from_slice(&512u32.to_be_bytes()); // minor_version
        for brand in [b"isom", b"iso6", b"iso2", b"avc1", b"mp41"] {
            body.extend_from_slice(brand);
        }
        bx(b"ftyp", &body)
    }

    /// True once every added track has captured its parameter sets, i.e.
    /// the `moov` can carry a real decoder config box for each `stsd`.
    fn all_csd_known(&self) -> bool {
        !self.streams.is_empty() && self.streams.values().all(|s| s.csd.is_some())
    }

    fn header_packet(&self) -> Packet {
        let mut data = BytesMut::new();
        data.put_slice(&Self::ftyp());
        data.put_slice(&self.moov());
        Packet {
            data: data.freeze(),
            is_first_of_frame: true,
            is_last_of_frame: true,
            timestamp_us: 0,
        }
    }

    fn moov(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&Self::mvhd(self.next_track_id));
        let mut tracks: Vec<_> = self.streams.values().collect();
        tracks.sort_by_key(|s| s.track_id);
        for stream in &tracks {
            body.extend_from_slice(&Self::trak(stream));
        }
        body.extend_from_slice(&Self::mvex(&tracks));
        bx(b"moov", &body)
    }

    fn mvhd(next_track_id: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        body.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        body.extend_from_slice(&TIMESCALE.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // duration (unknown, fragmented)
        body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        body.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        body.extend_from_slice(&[0u8; 2]); // reserved
        body.extend_from_slice(&[0u8; 8]); // reserved
        body.extend_from_slice(&identity_matrix());
        body.extend_from_slice(&[0u8; 24]); // pre_defined
        body.extend_from_slice(&next_track_id.to_be_bytes());
        full_box(b"mvhd", 0, 0, body)
    }

    fn trak(stream: &Fmp4Stream) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&Self::tkhd(stream));
        body.extend_from_slice(&Self::mdia(stream));
        bx(b"trak", &body)
    }

    fn tkhd(stream: &Fmp4Stream) -> Vec<u8> {
        let (width, height) = match stream.config.source {
            SourceConfig::Video(v) => (v.width, v.height),
            SourceConfig::Audio(_) => (0, 0),
        };
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        body.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        body.extend_from_slice(&stream.track_id.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]); // reserved
        body.extend_from_slice(&0u32.to_be_bytes()); // duration
        body.extend_from_slice(&[0u8; 8]); // reserved
        body.extend_from_slice(&0u16.to_be_bytes()); // layer
        body.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
        let volume: u16 = if stream.codec.kind() == MediaKind::Audio {
            0x0100
        } else {
            0
        };
        body.extend_from_slice(&volume.to_be_bytes());
        body.extend_from_slice(&[0u8; 2]); // reserved
        body.extend_from_slice(&identity_matrix());
        body.extend_from_slice(&((width as u32) << 16).to_be_bytes());
        body.extend_from_slice(&((height as u32) << 16).to_be_bytes());
        full_box(b"tkhd", 0, 0x0000_0007, body) // track_enabled | in_movie | in_preview
    }

    fn mdia(stream: &Fmp4Stream) -> Vec<u8> {
        let mut mdhd_body = Vec::new();
        mdhd_body.extend_from_slice(&0u32.to_be_bytes());
        mdhd_body.extend_from_slice(&0u32.to_be_bytes());
        mdhd_body.extend_from_slice(&TIMESCALE.to_be_bytes());
        mdhd_body.extend_from_slice(&0u32.to_be_bytes());
        mdhd_body.extend_from_slice(&0x55C4u16.to_be_bytes()); // language "und"
        mdhd_body.extend_from_slice(&0u16.to_be_bytes());
        let mdhd = full_box(b"mdhd", 0, 0, mdhd_body);

        let (handler_type, name): (&[u8; 4], &[u8]) = match stream.codec.kind() {
            MediaKind::Video => (b"vide", b"VideoHandler\0"),
            MediaKind::Audio => (b"soun", b"SoundHandler\0"),
        };
        let mut hdlr_body = vec![0u8; 4]; // pre_defined
        hdlr_body.extend_from_slice(handler_type);
        hdlr_body.extend_from_slice(&[0u8; 12]); // reserved
        hdlr_body.extend_from_slice(name);
        let hdlr = full_box(b"hdlr", 0, 0, hdlr_body);

        let minf = Self::minf(stream);

        let mut body = Vec::new();
        body.extend_from_slice(&mdhd);
        body.extend_from_slice(&hdlr);
        body.extend_from_slice(&minf);
        bx(b"mdia", &body)
    }

    fn minf(stream: &Fmp4Stream) -> Vec<u8> {
        let media_header = match stream.codec.kind() {
            MediaKind::Video => full_box(b"vmhd", 0, 1, vec![0u8; 8]),
            MediaKind::Audio => full_box(b"smhd", 0, 0, vec![0u8; 4]),
        };

        let url = full_box(b"url ", 0, 1, Vec::new());
        let dref = full_box(b"dref", 0, 0, {
            let mut b = 1u32.to_be_bytes().to_vec();
            b.extend_from_slice(&url);
            b
        });
        let dinf = bx(b"dinf", &dref);

        let stbl = Self::stbl(stream);

        let mut body = Vec::new();
        body.extend_from_slice(&media_header);
        body.extend_from_slice(&dinf);
        body.extend_from_slice(&stbl);
        bx(b"minf", &body)
    }

    fn stbl(stream: &Fmp4Stream) -> Vec<u8> {
        let stsd = Self::stsd(stream);
        let empty_stts = full_box(b"stts", 0, 0, 0u32.to_be_bytes().to_vec());
        let empty_stsc = full_box(b"stsc", 0, 0, 0u32.to_be_bytes().to_vec());
        let empty_stsz = full_box(b"stsz", 0, 0, {
            let mut b = 0u32.to_be_bytes().to_vec();
            b.extend_from_slice(&0u32.to_be_bytes());
            b
        });
        let empty_stco = full_box(b"stco", 0, 0, 0u32.to_be_bytes().to_vec());

        let mut body = Vec::new();
        body.extend_from_slice(&stsd);
        body.extend_from_slice(&empty_stts);
        body.extend_from_slice(&empty_stsc);
        body.extend_from_slice(&empty_stsz);
        body.extend_from_slice(&empty_stco);
        bx(b"stbl", &body)
    }

    fn stsd(stream: &Fmp4Stream) -> Vec<u8> {
        let entry = match stream.codec {
            Codec::Video(_) => Self::visual_sample_entry(stream),
            Codec::Audio(_) => Self::audio_sample_entry(stream),
        };
        let mut body = 1u32.to_be_bytes().to_vec();
        body.extend_from_slice(&entry);
        full_box(b"stsd", 0, 0, body)
    }

    fn visual_sample_entry(stream: &Fmp4Stream) -> Vec<u8> {
        let (width, height) = match stream.config.source {
            SourceConfig::Video(v) => (v.width as u16, v.height as u16),
            SourceConfig::Audio(_) => (0, 0),
        };
        let video_codec = match stream.codec {
            Codec::Video(c) => c,
            Codec::Audio(_) => unreachable!(),
        };
        let fourcc: &[u8; 4] = match video_codec {
            crate::types::VideoCodec::H264 => b"avc1",
            crate::types::VideoCodec::H265 => b"hev1",
            crate::types::VideoCodec::Vp9 => b"vp09",
            crate::types::VideoCodec::Av1 => b"av01",
        };

        let mut body = vec![0u8; 6]; // reserved
        body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        body.extend_from_slice(&[0u8; 16]); // pre_defined/reserved
        body.extend_from_slice(&width.to_be_bytes());
        body.extend_from_slice(&height.to_be_bytes());
        body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution 72dpi
        body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution
        body.extend_from_slice(&[0u8; 4]); // reserved
        body.extend_from_slice(&1u16.to_be_bytes()); // frame_count
        body.extend_from_slice(&[0u8; 32]); // compressorname
        body.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
        body.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined

        let csd = stream.csd.as_deref().unwrap_or(&[]);
        match video_codec {
            crate::types::VideoCodec::H264 => body.extend_from_slice(&avc_decoder_config_box(csd)),
            crate::types::VideoCodec::H265 => body.extend_from_slice(&hevc_decoder_config_box(csd)),
            // VP9/AV1 carry their codec-private data in-band (superframe
            // index / OBU sequence header), not a stsd config box.
            crate::types::VideoCodec::Vp9 | crate::types::VideoCodec::Av1 => {}
        }
        bx(fourcc, &body)
    }

    fn audio_sample_entry(stream: &Fmp4Stream) -> Vec<u8> {
        let (sample_rate, channels) = match stream.config.source {
            SourceConfig::Audio(a) => (a.sample_rate, a.channels),
            SourceConfig::Video(_) => (48_000, 2),
        };
        let fourcc: &[u8; 4] = match stream.codec {
            Codec::Audio(crate::types::AudioCodec::Aac) => b"mp4a",
            Codec::Audio(crate::types::AudioCodec::Opus) => b"Opus",
            Codec::Video(_) => unreachable!(),
        };

        let mut body = vec![0u8; 6]; // reserved
        body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        body.extend_from_slice(&[0u8; 8]); // reserved
        body.extend_from_slice(&channels.to_be_bytes());
        body.extend_from_slice(&16u16.to_be_bytes()); // samplesize
        body.extend_from_slice(&[0u8; 4]); // pre_defined/reserved
        body.extend_from_slice(&((sample_rate as u32) << 16).to_be_bytes());
        match stream.codec {
            Codec::Audio(crate::types::AudioCodec::Opus) => {
                body.extend_from_slice(&Self::dops(sample_rate, channels));
            }
            Codec::Audio(crate::types::AudioCodec::Aac) => {
                let csd = stream.csd.as_deref().unwrap_or(&[]);
                body.extend_from_slice(&esds_box(csd, stream.config.bitrate_bps));
            }
            Codec::Video(_) => unreachable!(),
        }
        bx(fourcc, &body)
    }

    /// Opus-in-ISOBMFF `dOps` box (channel mapping family 0, mono/stereo
    /// only — this muxer has no multi-stream Opus source to report a
    /// mapping table for).
    fn dops(sample_rate: u32, channels: u16) -> Vec<u8> {
        let mut body = Vec::with_capacity(11);
        body.push(0); // Version
        body.push(channels as u8); // OutputChannelCount
        body.extend_from_slice(&0u16.to_be_bytes()); // PreSkip
        body.extend_from_slice(&sample_rate.to_be_bytes()); // InputSampleRate
        body.extend_from_slice(&0i16.to_be_bytes()); // OutputGain
        body.push(0); // ChannelMappingFamily 0: no mapping table follows
        bx(b"dOps", &body)
    }

    fn mvex(tracks: &[&Fmp4Stream]) -> Vec<u8> {
        let mut body = Vec::new();
        for stream in tracks {
            let mut trex_body = Vec::new();
            trex_body.extend_from_slice(&stream.track_id.to_be_bytes());
            trex_body.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
            trex_body.extend_from_slice(&0u32.to_be_bytes()); // default_sample_duration
            trex_body.extend_from_slice(&0u32.to_be_bytes()); // default_sample_size
            trex_body.extend_from_slice(&0u32.to_be_bytes()); // default_sample_flags
            body.extend_from_slice(&full_box(b"trex", 0, 0, trex_body));
        }
        bx(b"mvex", &body)
    }
}

impl Default for FragmentedMp4Muxer {
    fn default() -> Self {
        Self::new()
    }
}

/// `AVCDecoderConfigurationRecord` wrapped in an `avcC` box, built from the
/// SPS/PPS pair a H.264 encoder attaches as CSD (spec §4.4 CSD
/// normalization guarantees that order). Mirrors `flv.rs`'s
/// `avc_decoder_config`, just without the FLV tag framing around it.
fn avc_decoder_config_box(csd: &[Bytes]) -> Vec<u8> {
    let sps = csd.first().cloned().unwrap_or_default();
    let pps = csd.get(1).cloned().unwrap_or_default();

    let mut record = Vec::new();
    record.push(0x01); // configurationVersion
    record.push(sps.get(1).copied().unwrap_or(0x64)); // AVCProfileIndication
    record.push(sps.get(2).copied().unwrap_or(0x00)); // profile_compatibility
    record.push(sps.get(3).copied().unwrap_or(0x1F)); // AVCLevelIndication
    record.push(0xFF); // reserved(6)=1 + lengthSizeMinusOne(2)=3 -> 4-byte NAL length
    record.push(0xE1); // reserved(3)=1 + numOfSPS(5)=1
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(&sps);
    record.push(0x01); // numOfPPS
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(&pps);
    bx(b"avcC", &record)
}

/// `HEVCDecoderConfigurationRecord` wrapped in an `hvcC` box, built from the
/// VPS/SPS/PPS triple a H.265 encoder attaches as CSD. Profile/level/chroma
/// fields fall back to common 4:2:0/8-bit defaults when the parameter sets
/// are too short to read them from, the same approximation
/// `avc_decoder_config_box` makes for AVC.
fn hevc_decoder_config_box(csd: &[Bytes]) -> Vec<u8> {
    let vps = csd.first().cloned().unwrap_or_default();
    let sps = csd.get(1).cloned().unwrap_or_default();
    let pps = csd.get(2).cloned().unwrap_or_default();

    let mut record = Vec::new();
    record.push(0x01); // configurationVersion
    record.push(sps.get(1).copied().unwrap_or(0x01) & 0x7F); // profile_space/tier/profile_idc
    record.extend_from_slice(&[0u8; 4]); // general_profile_compatibility_flags
    record.extend_from_slice(&[0u8; 6]); // general_constraint_indicator_flags
    record.push(sps.get(12).copied().unwrap_or(0x5A)); // general_level_idc
    record.extend_from_slice(&0xF000u16.to_be_bytes()); // reserved + min_spatial_segmentation_idc=0
    record.push(0xFC); // reserved + parallelismType=0
    record.push(0xFD); // reserved + chroma_format_idc=1 (4:2:0)
    record.push(0xF8); // reserved + bit_depth_luma_minus8=0
    record.push(0xF8); // reserved + bit_depth_chroma_minus8=0
    record.extend_from_slice(&0u16.to_be_bytes()); // avgFrameRate (unspecified)
    record.push(0x0B); // constantFrameRate=0, numTemporalLayers=1, temporalIdNested=0, lengthSizeMinusOne=3
    record.push(3); // numOfArrays

    for (nal_type, unit) in [(32u8, &vps), (33, &sps), (34, &pps)] {
        record.push(0x80 | nal_type); // array_completeness=1, reserved=0, NAL_unit_type
        record.extend_from_slice(&1u16.to_be_bytes()); // numNalus
        record.extend_from_slice(&(unit.len() as u16).to_be_bytes());
        record.extend_from_slice(unit);
    }
    bx(b"hvcC", &record)
}

fn mpeg4_descriptor(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![tag, payload.len() as u8];
    out.extend_from_slice(payload);
    out
}

/// MPEG-4 `ESDescriptor` wrapped in an `esds` box, carrying the
/// AudioSpecificConfig an AAC encoder attaches as CSD. Descriptor lengths
/// here always fit in one byte (AudioSpecificConfig is a handful of bytes),
/// so this skips the general multi-byte descriptor length encoding.
fn esds_box(csd: &[Bytes], bitrate_bps: u32) -> Vec<u8> {
    let audio_specific_config = csd.first().cloned().unwrap_or_default();
    let decoder_specific_info = mpeg4_descriptor(0x05, &audio_specific_config);

    let mut decoder_config_payload = vec![0x40]; // objectTypeIndication: MPEG-4 Audio (AAC)
    decoder_config_payload.push(0x15); // streamType=5 (audio), upStream=0, reserved=1
    decoder_config_payload.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    decoder_config_payload.extend_from_slice(&bitrate_bps.to_be_bytes()); // maxBitrate
    decoder_config_payload.extend_from_slice(&bitrate_bps.to_be_bytes()); // avgBitrate
    decoder_config_payload.extend_from_slice(&decoder_specific_info);
    let decoder_config = mpeg4_descriptor(0x04, &decoder_config_payload);

    let sl_config = mpeg4_descriptor(0x06, &[0x02]); // predefined=2: reserved for MP4 files

    let mut es_payload = vec![0, 1]; // ES_ID = 1
    es_payload.push(0); // flags
    es_payload.extend_from_slice(&decoder_config);
    es_payload.extend_from_slice(&sl_config);
    let es_descriptor = mpeg4_descriptor(0x03, &es_payload);

    full_box(b"esds", 0, 0, es_descriptor)
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

const SAMPLE_FLAG_NON_KEY: u32 = 1 << 16; // sample_is_difference_sample

impl super::Muxer for FragmentedMp4Muxer {
    fn add_stream(&mut self, config: &CodecConfig) -> StreamResult<StreamId> {
        let track_id = self.next_track_id;
        self.next_track_id += 1;
        let id = self.allocator.next();
        self.streams.insert(
            id,
            Fmp4Stream {
                track_id,
                codec: config.codec,
                config: config.clone(),
                csd: None,
            },
        );
        Ok(id)
    }

    fn remove_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
        self.pending.remove(&id);
    }

    fn start_stream(&mut self) -> StreamResult<Vec<Packet>> {
        self.header_emitted = false;
        Ok(Vec::new())
    }

    /// Buffers one sample per stream, because a sample's duration (spec
    /// §4.5.2) is only known once the following sample on the same track
    /// reports its own timestamp. `write` therefore emits the fragment for
    /// the *previous* sample on this stream, if any, and holds the current
    /// one back; the final sample per stream is flushed with an unknown
    /// duration by `stop_stream`. The very first call that completes CSD
    /// coverage for every added track also emits the `ftyp`+`moov` header,
    /// ahead of any fragment it produces.
    fn write(&mut self, id: StreamId, frame: Frame) -> StreamResult<Vec<Packet>> {
        let (track_id, kind) = {
            let stream = self
                .streams
                .get_mut(&id)
                .ok_or_else(|| StreamError::config("unknown stream id"))?;
            if stream.csd.is_none() && !frame.csd.is_empty() {
                stream.csd = Some(frame.csd.clone());
            }
            (stream.track_id, stream.codec.kind())
        };

        let mut sample_data = BytesMut::new();
        if kind == MediaKind::Video && frame.is_key_frame {
            for unit in &frame.csd {
                sample_data.put_u32(unit.len() as u32); // length-prefixed (avcC/hvcC style)
                sample_data.put_slice(unit);
            }
        }
        sample_data.put_slice(&frame.data);

        let dts_us = frame.dts_us.unwrap_or(frame.pts_us);
        let cto = frame.dts_us.map(|dts| (frame.pts_us - dts) as i32).unwrap_or(0);
        let sample_flags = if kind == MediaKind::Video && !frame.is_key_frame {
            SAMPLE_FLAG_NON_KEY
        } else {
            0
        };

        let incoming = PendingSample {
            dts_us,
            sample_data: sample_data.freeze(),
            sample_flags,
            cto,
        };
        let previous = self.pending.insert(id, incoming);

        let mut out = Vec::new();
        if !self.header_emitted && self.all_csd_known() {
            out.push(self.header_packet());
            self.header_emitted = true;
        }
        if let Some(previous) = previous {
            let duration_us = (dts_us - previous.dts_us).max(0) as u32;
            out.push(self.emit_fragment(track_id, &previous, Some(duration_us)));
        }
        Ok(out)
    }

    fn stop_stream(&mut self) -> StreamResult<Vec<Packet>> {
        let mut out = Vec::new();
        let track_ids: HashMap<StreamId, u32> = self
            .streams
            .iter()
            .map(|(id, s)| (*id, s.track_id))
            .collect();
        for (id, pending) in self.pending.drain() {
            if let Some(track_id) = track_ids.get(&id) {
                out.push(Self::fragment_for(
                    &mut self.next_sequence_number,
                    *track_id,
                    &pending,
                    None,
                ));
            }
        }
        Ok(out)
    }
}

impl FragmentedMp4Muxer {
    fn emit_fragment(
        &mut self,
        track_id: u32,
        sample: &PendingSample,
        duration_us: Option<u32>,
    ) -> Packet {
        Self::fragment_for(&mut self.next_sequence_number, track_id, sample, duration_us)
    }

    fn fragment_for(
        next_sequence_number: &mut u32,
        track_id: u32,
        sample: &PendingSample,
        duration_us: Option<u32>,
    ) -> Packet {
        let sequence_number = *next_sequence_number;
        *next_sequence_number += 1;

        let moof = build_moof(
            sequence_number,
            track_id,
            sample.dts_us,
            sample.sample_data.len() as u32,
            sample.sample_flags,
            sample.cto,
            duration_us,
        );
        let mdat = bx(b"mdat", &sample.sample_data);

        let mut out = BytesMut::with_capacity(moof.len() + mdat.len());
        out.put_slice(&moof);
        out.put_slice(&mdat);

        Packet {
            data: out.freeze(),
            is_first_of_frame: true,
            is_last_of_frame: true,
            timestamp_us: sample.dts_us,
        }
    }
}

fn build_moof(
    sequence_number: u32,
    track_id: u32,
    base_media_decode_time: i64,
    sample_size: u32,
    sample_flags: u32,
    composition_time_offset: i32,
    sample_duration: Option<u32>,
) -> Vec<u8> {
    let mfhd = full_box(b"mfhd", 0, 0, sequence_number.to_be_bytes().to_vec());

    let tfhd_flags = 0x02_0000; // default-base-is-moof
    let mut tfhd_body = track_id.to_be_bytes().to_vec();
    let tfhd = full_box(b"tfhd", 0, tfhd_flags, tfhd_body.drain(..).collect());

    let tfdt = if base_media_decode_time >= 0 && base_media_decode_time <= u32::MAX as i64 {
        full_box(
            b"tfdt",
            0,
            0,
            (base_media_decode_time as u32).to_be_bytes().to_vec(),
        )
    } else {
        full_box(
            b"tfdt",
            1,
            0,
            (base_media_decode_time as u64).to_be_bytes().to_vec(),
        )
    };

    let has_cto = composition_time_offset != 0;
    let mut trun_flags = 0x0000_0001 // data-offset-present
        | 0x0000_0200 // sample-size-present
        | 0x0000_0400; // sample-flags-present
    if sample_duration.is_some() {
        trun_flags |= 0x0000_0100; // sample-duration-present
    }
    if has_cto {
        trun_flags |= 0x0000_0800;
    }

    let mut trun_body = Vec::new();
    trun_body.extend_from_slice(&1u32.to_be_bytes()); // sample_count
    let data_offset_pos = trun_body.len();
    trun_body.extend_from_slice(&0i32.to_be_bytes()); // data_offset placeholder
    if let Some(duration) = sample_duration {
        trun_body.extend_from_slice(&duration.to_be_bytes());
    }
    trun_body.extend_from_slice(&sample_size.to_be_bytes());
    trun_body.extend_from_slice(&sample_flags.to_be_bytes());
    if has_cto {
        trun_body.extend_from_slice(&composition_time_offset.to_be_bytes());
    }
    let trun_unfixed = full_box(b"trun", 0, trun_flags, trun_body);

    let traf_body_len_without_trun = 8 + tfhd.len() + tfdt.len();
    let moof_header_len = 8;
    let mfhd_len = mfhd.len();
    let traf_header_len = 8;
    let data_offset =
        moof_header_len + mfhd_len + traf_header_len + traf_body_len_without_trun - 8
            + trun_unfixed.len()
            + 8; // + mdat header

    let mut trun = trun_unfixed;
    let fixed_offset = 8 + data_offset_pos; // +8 for trun's own box header
    trun[fixed_offset..fixed_offset + 4].copy_from_slice(&(data_offset as i32).to_be_bytes());

    let mut traf_body = Vec::new();
    traf_body.extend_from_slice(&tfhd);
    traf_body.extend_from_slice(&tfdt);
    traf_body.extend_from_slice(&trun);
    let traf = bx(b"traf", &traf_body);

    let mut moof_body = Vec::new();
    moof_body.extend_from_slice(&mfhd);
    moof_body.extend_from_slice(&traf);
    bx(b"moof", &moof_body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Muxer as _;
    use crate::types::{AudioSourceConfig, ByteFormat, SourceConfig, VideoCodec, VideoSourceConfig};

    fn video_config() -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Video(VideoSourceConfig {
                width: 640,
                height: 480,
                fps: 30,
                dynamic_range: crate::types::DynamicRangeProfile::Sdr,
            }),
            codec: Codec::Video(VideoCodec::H264),
            bitrate_bps: 1_000_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    fn read_u32(data: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    fn key_frame(pts_us: i64) -> Frame {
        Frame::new(
            Bytes::from_static(b"nal-data"),
            pts_us,
            Some(pts_us),
            true,
            vec![Bytes::from_static(b"sps"), Bytes::from_static(b"pps")],
            Codec::Video(VideoCodec::H264),
        )
        .unwrap()
    }

    #[test]
    fn start_stream_emits_nothing_until_csd_is_known() {
        let mut muxer = FragmentedMp4Muxer::new();
        muxer.add_stream(&video_config()).unwrap();
        assert!(muxer.start_stream().unwrap().is_empty());
    }

    #[test]
    fn first_write_with_csd_emits_ftyp_then_moov() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&video_config()).unwrap();
        muxer.start_stream().unwrap();

        let packets = muxer.write(id, key_frame(0)).unwrap();
        assert_eq!(packets.len(), 1, "header only, duration for sample 1 isn't known yet");
        let data = &packets[0].data;
        assert_eq!(&data[4..8], b"ftyp");
        let ftyp_len = read_u32(data, 0) as usize;
        assert_eq!(&data[ftyp_len + 4..ftyp_len + 8], b"moov");
    }

    #[test]
    fn box_sizes_account_for_entire_payload() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&video_config()).unwrap();
        muxer.start_stream().unwrap();
        let packets = muxer.write(id, key_frame(0)).unwrap();
        let data = &packets[0].data;
        let ftyp_len = read_u32(data, 0) as usize;
        let moov_len = read_u32(data, ftyp_len) as usize;
        assert_eq!(ftyp_len + moov_len, data.len());
    }

    #[test]
    fn visual_sample_entry_carries_an_avcc_box_built_from_csd() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&video_config()).unwrap();
        muxer.start_stream().unwrap();
        let packets = muxer.write(id, key_frame(0)).unwrap();
        let data = &packets[0].data;

        let needle = b"avcC";
        let pos = data
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("stsd must contain an avcC box for a H.264 track");
        let record = &data[pos + 4..];
        assert_eq!(record[0], 1, "configurationVersion");
        // numOfSPS low 5 bits = 1, then 2-byte length + "sps".
        assert_eq!(record[5] & 0x1F, 1);
        assert_eq!(&record[6..8], &3u16.to_be_bytes());
        assert_eq!(&record[8..11], b"sps");
    }

    #[test]
    fn write_buffers_first_sample_and_emits_fragment_on_the_second() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&video_config()).unwrap();
        muxer.start_stream().unwrap();

        // The first write completes CSD coverage and emits only the header;
        // duration for sample 1 isn't known until sample 2's timestamp
        // arrives, so no fragment comes out yet.
        let header = muxer.write(id, key_frame(0)).unwrap();
        assert_eq!(header.len(), 1);
        assert_eq!(&header[0].data[4..8], b"ftyp");

        let packets = muxer.write(id, key_frame(33_333)).unwrap();
        assert_eq!(packets.len(), 1);
        let data = &packets[0].data;
        assert_eq!(&data[4..8], b"moof");
        let moof_len = read_u32(data, 0) as usize;
        assert_eq!(&data[moof_len + 4..moof_len + 8], b"mdat");
    }

    #[test]
    fn stop_stream_flushes_the_final_buffered_sample() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&video_config()).unwrap();
        muxer.start_stream().unwrap();
        let header = muxer.write(id, key_frame(0)).unwrap();
        assert_eq!(header.len(), 1);
        let flushed = muxer.stop_stream().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(&flushed[0].data[4..8], b"moof");
    }

    fn opus_config(channels: u16) -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Audio(AudioSourceConfig {
                sample_rate: 48_000,
                channels,
                byte_format: ByteFormat::F32Le,
            }),
            codec: Codec::Audio(crate::types::AudioCodec::Opus),
            bitrate_bps: 96_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    fn opus_frame(pts_us: i64) -> Frame {
        Frame::new(
            Bytes::from_static(b"opus-packet"),
            pts_us,
            None,
            true,
            vec![Bytes::from_static(b"opus-csd")],
            Codec::Audio(crate::types::AudioCodec::Opus),
        )
        .unwrap()
    }

    #[test]
    fn opus_stream_entry_carries_a_family_zero_dops_box() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&opus_config(2)).unwrap();
        muxer.start_stream().unwrap();
        let packets = muxer.write(id, opus_frame(0)).unwrap();
        let data = &packets[0].data;

        let needle = b"dOps";
        let pos = data
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("moov must contain a dOps box for an Opus stream");
        // dOps body: Version, OutputChannelCount, PreSkip(2), InputSampleRate(4),
        // OutputGain(2), ChannelMappingFamily.
        let body = &data[pos + 4..pos + 4 + 11];
        assert_eq!(body[0], 0, "dOps version must be 0");
        assert_eq!(body[1], 2, "OutputChannelCount must match the source config");
        assert_eq!(&body[4..8], &48_000u32.to_be_bytes());
        assert_eq!(body[10], 0, "channel mapping family 0 carries no mapping table");
    }

    #[test]
    fn aac_stream_entry_carries_an_esds_box_built_from_csd() {
        let config = CodecConfig {
            source: SourceConfig::Audio(AudioSourceConfig {
                sample_rate: 48_000,
                channels: 2,
                byte_format: ByteFormat::S16Le,
            }),
            codec: Codec::Audio(crate::types::AudioCodec::Aac),
            bitrate_bps: 128_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        };
        let frame = Frame::new(
            Bytes::from_static(b"aac-frame"),
            0,
            None,
            true,
            vec![Bytes::from_static(b"\x11\x90")],
            Codec::Audio(crate::types::AudioCodec::Aac),
        )
        .unwrap();

        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&config).unwrap();
        muxer.start_stream().unwrap();
        let packets = muxer.write(id, frame).unwrap();
        let data = &packets[0].data;

        let needle = b"esds";
        let pos = data
            .windows(needle.len())
            .position(|w| w == needle)
            .expect("stsd must contain an esds box for an AAC track");
        // FullBox header (4 bytes) then ES_Descriptor tag 0x03.
        assert_eq!(data[pos + 4 + 4], 0x03);
    }

    #[test]
    fn ftyp_carries_the_documented_brands() {
        let mut muxer = FragmentedMp4Muxer::new();
        let id = muxer.add_stream(&video_config()).unwrap();
        muxer.start_stream().unwrap();
        let packets = muxer.write(id, key_frame(0)).unwrap();
        let data = &packets[0].data;
        assert_eq!(&data[8..12], b"isom", "major_brand");
        assert_eq!(u32::from_be_bytes(data[12..16].try_into().unwrap()), 512);
        let compat = &data[16..36];
        for brand in [b"isom", b"iso6", b"iso2", b"avc1", b"mp41"] {
            assert!(compat.windows(4).any(|w| w == brand), "missing compat brand {brand:?}");
        }
    }
}
