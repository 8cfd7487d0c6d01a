//! FLV muxer (spec §4.6).
//!
//! Classic FLV only understands AVC video and AAC audio; this muxer still
//! rejects codecs it can't carry at all with `ErrorKind::Unsupported`, but
//! per spec §4.5.3 also speaks the "enhanced RTMP" extension for HEVC, VP9,
//! AV1 (video) and Opus (audio): a FourCC-tagged packet type byte replaces
//! the classic `codec_id` nibble whenever the high bit of the tag's first
//! byte is set, carrying a 4-byte codec FourCC immediately after it.
//! `start_stream` emits the 9-byte FLV header plus an `onMetaData` script
//! tag; every tag — metadata, sequence headers, and media — is followed by
//! its four-byte `PreviousTagSize` trailer.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{StreamError, StreamResult};
use crate::types::{AudioCodec, Codec, CodecConfig, Frame, MediaKind, Packet, SourceConfig, StreamId, VideoCodec};

use super::StreamIdAllocator;

const VIDEO_TAG_TYPE: u8 = 9;
const AUDIO_TAG_TYPE: u8 = 8;
const SCRIPT_TAG_TYPE: u8 = 18;

// Enhanced RTMP extended video tag header: top bit of the first byte marks
// "is extended"; the low nibble is then a packet type rather than a codec
// id, and a 4-byte FourCC follows immediately.
const EX_VIDEO_HEADER_FLAG: u8 = 0x80;
const EX_VIDEO_PACKET_TYPE_SEQUENCE_START: u8 = 0;
const EX_VIDEO_PACKET_TYPE_CODED_FRAMES: u8 = 1;
const EX_AUDIO_HEADER_FLAG: u8 = 0x90; // sound_format nibble 9 marks "enhanced"
const EX_AUDIO_PACKET_TYPE_SEQUENCE_START: u8 = 0;
const EX_AUDIO_PACKET_TYPE_CODED_FRAMES: u8 = 1;

fn extended_video_fourcc(codec: VideoCodec) -> Option<&'static [u8; 4]> {
    match codec {
        VideoCodec::H265 => Some(b"hvc1"),
        VideoCodec::Vp9 => Some(b"vp09"),
        VideoCodec::Av1 => Some(b"av01"),
        VideoCodec::H264 => None,
    }
}

struct FlvStream {
    codec: Codec,
    sent_sequence_header: bool,
}

/// FLV muxer.
pub struct FlvMuxer {
    streams: HashMap<StreamId, FlvStream>,
    allocator: StreamIdAllocator,
    video_config: Option<CodecConfig>,
    audio_config: Option<CodecConfig>,
}

impl FlvMuxer {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            allocator: StreamIdAllocator::default(),
            video_config: None,
            audio_config: None,
        }
    }

    fn build_tag(tag_type: u8, timestamp_us: i64, data: &[u8]) -> Vec<u8> {
        let timestamp_ms = (timestamp_us / 1000) as u32;
        let mut tag = Vec::with_capacity(11 + data.len() + 4);
        tag.push(tag_type);
        tag.extend_from_slice(&data.len().to_be_bytes()[5..8]); // 24-bit data_size
        tag.extend_from_slice(&timestamp_ms.to_be_bytes()[1..4]); // 24-bit timestamp
        tag.push((timestamp_ms >> 24) as u8); // timestamp_extended
        tag.extend_from_slice(&[0, 0, 0]); // stream_id
        tag.extend_from_slice(data);
        let previous_tag_size = (tag.len()) as u32;
        tag.extend_from_slice(&previous_tag_size.to_be_bytes());
        tag
    }

    fn on_metadata_tag(&self) -> Vec<u8> {
        let mut props = Vec::new();
        if let Some(CodecConfig {
            source: SourceConfig::Video(v),
            ..
        }) = &self.video_config
        {
            props.push(("width".to_string(), Amf0::Number(v.width as f64)));
            props.push(("height".to_string(), Amf0::Number(v.height as f64)));
            props.push(("framerate".to_string(), Amf0::Number(v.fps as f64)));
            let video_codec = self.video_config.as_ref().map(|c| match c.codec {
                Codec::Video(VideoCodec::H264) => Amf0::Number(7.0),
                Codec::Video(codec) => Amf0::String(
                    String::from_utf8_lossy(extended_video_fourcc(codec).unwrap()).into_owned(),
                ),
                Codec::Audio(_) => unreachable!(),
            });
            props.push(("videocodecid".to_string(), video_codec.unwrap()));
        }
        if let Some(CodecConfig {
            source: SourceConfig::Audio(a),
            ..
        }) = &self.audio_config
        {
            props.push((
                "audiosamplerate".to_string(),
                Amf0::Number(a.sample_rate as f64),
            ));
            props.push(("audiosamplesize".to_string(), Amf0::Number(16.0)));
            props.push(("stereo".to_string(), Amf0::Bool(a.channels > 1)));
            let audio_codec = match self.audio_config.as_ref().unwrap().codec {
                Codec::Audio(AudioCodec::Aac) => Amf0::Number(10.0),
                Codec::Audio(AudioCodec::Opus) => Amf0::String("Opus".to_string()),
                Codec::Video(_) => unreachable!(),
            };
            props.push(("audiocodecid".to_string(), audio_codec));
        }
        props.push(("duration".to_string(), Amf0::Number(0.0)));

        let mut data = Vec::new();
        Amf0::String("onMetaData".to_string()).encode(&mut data);
        Amf0::EcmaArray(props).encode(&mut data);
        Self::build_tag(SCRIPT_TAG_TYPE, 0, &data)
    }
}

impl Default for FlvMuxer {
    fn default() -> Self {
        Self::new()
    }
}

enum Amf0 {
    Number(f64),
    Bool(bool),
    String(String),
    EcmaArray(Vec<(String, Amf0)>),
}

impl Amf0 {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Amf0::Number(n) => {
                out.push(0x00);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Amf0::Bool(b) => {
                out.push(0x01);
                out.push(*b as u8);
            }
            Amf0::String(s) => {
                out.push(0x02);
                out.extend_from_slice(&(s.len() as u16).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Amf0::EcmaArray(props) => {
                out.push(0x08);
                out.extend_from_slice(&(props.len() as u32).to_be_bytes());
                for (key, value) in props {
                    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
                    out.extend_from_slice(key.as_bytes());
                    value.encode(out);
                }
                out.extend_from_slice(&[0x00, 0x00, 0x09]); // object end marker
            }
        }
    }
}

fn avc_decoder_config(csd: &[Bytes]) -> Vec<u8> {
    let sps = csd.first().cloned().unwrap_or_default();
    let pps = csd.get(1).cloned().unwrap_or_default();

    let mut out = Vec::new();
    out.push(0x01); // configurationVersion
    out.push(sps.get(1).copied().unwrap_or(0x64)); // AVCProfileIndication
    out.push(sps.get(2).copied().unwrap_or(0x00)); // profile_compatibility
    out.push(sps.get(3).copied().unwrap_or(0x1F)); // AVCLevelIndication
    out.push(0xFF); // reserved(6)=1 + lengthSizeMinusOne(2)=3 -> 4-byte NAL length
    out.push(0xE1); // reserved(3)=1 + numOfSPS(5)=1
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(&sps);
    out.push(0x01); // numOfPPS
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(&pps);
    out
}

fn video_tag_body(is_key_frame: bool, is_sequence_header: bool, nal_data: &[u8]) -> Vec<u8> {
    let frame_type: u8 = if is_key_frame { 1 } else { 2 };
    let codec_id: u8 = 7; // AVC
    let mut body = vec![(frame_type << 4) | codec_id];
    body.push(if is_sequence_header { 0 } else { 1 }); // AVCPacketType
    body.extend_from_slice(&[0, 0, 0]); // CompositionTime (24-bit signed, 0 here)
    body.extend_from_slice(nal_data);
    body
}

/// Enhanced-RTMP extended video tag body (spec §4.5.3: HEVC/VP9/AV1).
fn extended_video_tag_body(
    fourcc: &[u8; 4],
    is_key_frame: bool,
    is_sequence_header: bool,
    payload: &[u8],
) -> Vec<u8> {
    let frame_type: u8 = if is_key_frame { 1 } else { 2 };
    let packet_type = if is_sequence_header {
        EX_VIDEO_PACKET_TYPE_SEQUENCE_START
    } else {
        EX_VIDEO_PACKET_TYPE_CODED_FRAMES
    };
    let mut body = vec![EX_VIDEO_HEADER_FLAG | (frame_type << 4) | packet_type];
    body.extend_from_slice(fourcc);
    body.extend_from_slice(payload);
    body
}

fn audio_tag_body(is_sequence_header: bool, payload: &[u8]) -> Vec<u8> {
    let sound_format: u8 = 10; // AAC
    let sound_rate: u8 = 3; // 44kHz flag slot (ignored by AAC decoders, kept for compatibility)
    let sound_size: u8 = 1; // 16-bit
    let sound_type: u8 = 1; // stereo
    let mut body = vec![(sound_format << 4) | (sound_rate << 2) | (sound_size << 1) | sound_type];
    body.push(if is_sequence_header { 0 } else { 1 }); // AACPacketType
    body.extend_from_slice(payload);
    body
}

/// Enhanced-RTMP extended audio tag body (spec §4.5.3: Opus).
fn extended_audio_tag_body(is_sequence_header: bool, payload: &[u8]) -> Vec<u8> {
    let packet_type = if is_sequence_header {
        EX_AUDIO_PACKET_TYPE_SEQUENCE_START
    } else {
        EX_AUDIO_PACKET_TYPE_CODED_FRAMES
    };
    let mut body = vec![EX_AUDIO_HEADER_FLAG | packet_type];
    body.extend_from_slice(b"Opus");
    body.extend_from_slice(payload);
    body
}

fn length_prefixed_nals(data: &[u8]) -> Bytes {
    let units = crate::encoder::split_annexb_units(data);
    let mut out = BytesMut::new();
    for unit in units {
        out.put_u32(unit.len() as u32);
        out.put_slice(&unit);
    }
    out.freeze()
}

impl super::Muxer for FlvMuxer {
    fn add_stream(&mut self, config: &CodecConfig) -> StreamResult<StreamId> {
        match config.codec {
            Codec::Video(_) => self.video_config = Some(config.clone()),
            Codec::Audio(_) => self.audio_config = Some(config.clone()),
        }
        let id = self.allocator.next();
        self.streams.insert(
            id,
            FlvStream {
                codec: config.codec,
                sent_sequence_header: false,
            },
        );
        Ok(id)
    }

    fn remove_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    fn start_stream(&mut self) -> StreamResult<Vec<Packet>> {
        let has_audio = self.audio_config.is_some();
        let has_video = self.video_config.is_some();
        let flags = (has_audio as u8 * 0x04) | (has_video as u8 * 0x01);

        let mut data = BytesMut::new();
        data.put_slice(b"FLV");
        data.put_u8(1); // version
        data.put_u8(flags);
        data.put_u32(9); // data_offset
        data.put_u32(0); // PreviousTagSize0

        for stream in self.streams.values_mut() {
            stream.sent_sequence_header = false;
        }
        data.put_slice(&self.on_metadata_tag());

        Ok(vec![Packet {
            data: data.freeze(),
            is_first_of_frame: true,
            is_last_of_frame: true,
            timestamp_us: 0,
        }])
    }

    fn write(&mut self, id: StreamId, frame: Frame) -> StreamResult<Vec<Packet>> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| StreamError::config("unknown stream id"))?;

        let mut out = BytesMut::new();
        let needs_sequence_header = !stream.sent_sequence_header;

        match stream.codec {
            Codec::Video(VideoCodec::H264) => {
                if needs_sequence_header {
                    if frame.csd.is_empty() {
                        return Err(StreamError::protocol(
                            "first video frame must carry CSD to build AVCDecoderConfigurationRecord",
                        ));
                    }
                    let config_record = avc_decoder_config(&frame.csd);
                    let body = video_tag_body(true, true, &config_record);
                    out.put_slice(&Self::build_tag(VIDEO_TAG_TYPE, frame.pts_us, &body));
                    stream.sent_sequence_header = true;
                }
                let nal_data = length_prefixed_nals(&frame.data);
                let body = video_tag_body(frame.is_key_frame, false, &nal_data);
                out.put_slice(&Self::build_tag(VIDEO_TAG_TYPE, frame.pts_us, &body));
            }
            Codec::Video(codec @ (VideoCodec::H265 | VideoCodec::Vp9 | VideoCodec::Av1)) => {
                let fourcc = extended_video_fourcc(codec).expect("extended codec has a FourCC");
                if needs_sequence_header {
                    if frame.csd.is_empty() {
                        return Err(StreamError::protocol(
                            "first video frame must carry CSD for an enhanced-RTMP sequence start",
                        ));
                    }
                    // HEVC's CSD is SPS/PPS/VPS; carry the concatenated set
                    // as the sequence-start payload (matching how this
                    // encoder normalizes CSD — see encoder::split_csd).
                    let mut config_record = Vec::new();
                    for unit in &frame.csd {
                        config_record.extend_from_slice(unit);
                    }
                    let body = extended_video_tag_body(fourcc, true, true, &config_record);
                    out.put_slice(&Self::build_tag(VIDEO_TAG_TYPE, frame.pts_us, &body));
                    stream.sent_sequence_header = true;
                }
                let payload = if codec == VideoCodec::H265 {
                    length_prefixed_nals(&frame.data)
                } else {
                    frame.data.clone()
                };
                let body = extended_video_tag_body(fourcc, frame.is_key_frame, false, &payload);
                out.put_slice(&Self::build_tag(VIDEO_TAG_TYPE, frame.pts_us, &body));
            }
            Codec::Audio(AudioCodec::Aac) => {
                if needs_sequence_header {
                    let asc = frame.csd.first().cloned().unwrap_or_default();
                    let body = audio_tag_body(true, &asc);
                    out.put_slice(&Self::build_tag(AUDIO_TAG_TYPE, frame.pts_us, &body));
                    stream.sent_sequence_header = true;
                }
                let body = audio_tag_body(false, &frame.data);
                out.put_slice(&Self::build_tag(AUDIO_TAG_TYPE, frame.pts_us, &body));
            }
            Codec::Audio(AudioCodec::Opus) => {
                if needs_sequence_header {
                    let header = frame.csd.first().cloned().unwrap_or_default();
                    let body = extended_audio_tag_body(true, &header);
                    out.put_slice(&Self::build_tag(AUDIO_TAG_TYPE, frame.pts_us, &body));
                    stream.sent_sequence_header = true;
                }
                let body = extended_audio_tag_body(false, &frame.data);
                out.put_slice(&Self::build_tag(AUDIO_TAG_TYPE, frame.pts_us, &body));
            }
        }

        Ok(vec![Packet {
            data: out.freeze(),
            is_first_of_frame: true,
            is_last_of_frame: true,
            timestamp_us: frame.pts_us,
        }])
    }

    fn stop_stream(&mut self) -> StreamResult<Vec<Packet>> {
        Ok(Vec::new())
    }
}
