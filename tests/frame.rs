//! Wire protocol invariants

use voxrelay::protocol::{self, frame::format, AudioProfile, FrameHeader, FrameType, Topic};

/// Round-trip a grid of in-range header values through encode/decode
#[test]
fn headers_round_trip_across_field_ranges() {
    let payload = b"payload bytes";

    for version in [0u8, 1, 7, 15] {
        for audio_format in [format::PCM, format::OPUS, format::WAV, 0xFF] {
            for sample_rate in [8_000u16, 16_000, 44_100, 0xFFFF] {
                for channels in [1u8, 2, 3] {
                    for frame_type in [FrameType::Full, FrameType::Fragment, FrameType::Last] {
                        let header = FrameHeader {
                            version,
                            audio_format,
                            sample_rate,
                            channels,
                            frame_type: frame_type.bits(),
                            frame_seq: 42,
                            timestamp: 777,
                            payload_len: 0,
                            crc16: 0,
                        };
                        let encoded = protocol::encode(header, payload);
                        let (decoded, body) = protocol::decode(&encoded).unwrap();

                        assert_eq!(decoded.version, version);
                        assert_eq!(decoded.audio_format, audio_format);
                        assert_eq!(decoded.sample_rate, sample_rate);
                        assert_eq!(decoded.channels, channels);
                        assert_eq!(decoded.frame_type, frame_type.bits());
                        assert_eq!(decoded.frame_seq, 42);
                        assert_eq!(decoded.timestamp, 777);
                        assert_eq!(body, payload);
                    }
                }
            }
        }
    }
}

/// Flipping any single bit of an encoded frame fails the CRC check
#[test]
fn any_bit_flip_fails_crc() {
    let encoded = protocol::build_full(b"sensitive audio payload", AudioProfile::default());

    for byte in 0..encoded.len() {
        for bit in 0..8 {
            let mut corrupted = encoded.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                protocol::decode(&corrupted).is_err(),
                "byte {byte} bit {bit} slipped through"
            );
        }
    }
}

/// Outbound stream frames carry caller-assigned sequence numbers
#[test]
fn stream_sequence_is_caller_assigned() {
    let profile = AudioProfile::default();
    for (seq, last) in [(0u16, false), (1, false), (2, true)] {
        let encoded = protocol::build_stream(seq, b"chunk", profile, last);
        let (header, _) = protocol::decode(&encoded).unwrap();
        assert_eq!(header.frame_seq, seq);
        let expected = if last {
            FrameType::Last
        } else {
            FrameType::Fragment
        };
        assert_eq!(header.frame_type, expected.bits());
    }
}

/// Valid topics survive parse(render(t))
#[test]
fn topics_round_trip() {
    for raw in [
        "test/T0001/A0001/voice/server",
        "test/T0001/A0001/voice/client",
        "public/M3/unit_77/ota/server",
        "halcyon/H2/SN900/voice/client",
    ] {
        let topic = Topic::parse(raw).unwrap();
        assert_eq!(Topic::parse(&topic.render()).unwrap(), topic);
    }
}
