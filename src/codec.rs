//! Binary wire format of the data channel.
//!
//! Input events go out as a one byte [`MessageType`] tag followed by a fixed
//! little-endian payload. JSON requests ride inside a `UIInteraction` frame
//! whose text is widened to two bytes per character. Responses come back as a
//! marker byte followed by the widened JSON text.

use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Tags understood by the remote input handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // Control messages, 0..49
    IFrameRequest = 0,
    RequestQualityControl = 1,
    MaxFpsRequest = 2,
    AverageBitrateRequest = 3,
    StartStreaming = 4,
    StopStreaming = 5,

    // Generic input, 50..59
    UIInteraction = 50,
    Command = 51,

    // Keyboard, 60..69
    KeyDown = 60,
    KeyUp = 61,
    KeyPress = 62,

    // Mouse, 70..79
    MouseEnter = 70,
    MouseLeave = 71,
    MouseDown = 72,
    MouseUp = 73,
    MouseMove = 74,
    MouseWheel = 75,

    // Touch, 80..89
    TouchStart = 80,
    TouchEnd = 81,
    TouchMove = 82,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use MessageType::*;
        let t = match tag {
            0 => IFrameRequest,
            1 => RequestQualityControl,
            2 => MaxFpsRequest,
            3 => AverageBitrateRequest,
            4 => StartStreaming,
            5 => StopStreaming,
            50 => UIInteraction,
            51 => Command,
            60 => KeyDown,
            61 => KeyUp,
            62 => KeyPress,
            70 => MouseEnter,
            71 => MouseLeave,
            72 => MouseDown,
            73 => MouseUp,
            74 => MouseMove,
            75 => MouseWheel,
            80 => TouchStart,
            81 => TouchEnd,
            82 => TouchMove,
            _ => return None,
        };
        Some(t)
    }
}

/// Key names accepted by [`key_code`], with their JavaScript key codes.
const KEY_CODES: &[(&str, u8)] = &[
    ("tab", 9),
    ("shift", 16),
    ("ctrl", 17),
    ("alt", 18),
    ("left", 37),
    ("up", 38),
    ("right", 39),
    ("down", 40),
    ("zero", 48),
    ("one", 49),
    ("two", 50),
    ("three", 51),
    ("four", 52),
    ("five", 53),
    ("six", 54),
    ("seven", 55),
    ("eight", 56),
    ("nine", 57),
    ("a", 65),
    ("b", 66),
    ("c", 67),
    ("d", 68),
    ("e", 69),
    ("f", 70),
    ("g", 71),
    ("h", 72),
    ("i", 73),
    ("j", 74),
    ("k", 75),
    ("l", 76),
    ("m", 77),
    ("n", 78),
    ("o", 79),
    ("p", 80),
    ("q", 81),
    ("r", 82),
    ("s", 83),
    ("t", 84),
    ("u", 85),
    ("v", 86),
    ("w", 87),
    ("x", 88),
    ("y", 89),
    ("z", 90),
];

/// Looks up the key code for a key name. Unknown names yield `None`.
pub fn key_code(name: &str) -> Option<u8> {
    KEY_CODES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MouseButton {
    Left = 0,
    Middle = 1,
    Right = 2,
}

impl MouseButton {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "left" => Some(MouseButton::Left),
            "middle" => Some(MouseButton::Middle),
            "right" => Some(MouseButton::Right),
            _ => None,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MouseButton::Left),
            1 => Some(MouseButton::Middle),
            2 => Some(MouseButton::Right),
            _ => None,
        }
    }
}

/// A single user input, consumed once by [`encode_input`].
///
/// Positions are percentages of the viewport in `[0, 100]`, deltas are
/// percentages in `[-100, 100]`.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key {
        code: u8,
        down: bool,
    },
    MouseButton {
        button: MouseButton,
        x: f64,
        y: f64,
        down: bool,
    },
    MouseMove {
        x: f64,
        y: f64,
        dx: f64,
        dy: f64,
    },
}

impl InputEvent {
    /// True if a mouse delta falls outside what an `i16` can carry and will be
    /// clamped on encode.
    pub fn saturates(&self) -> bool {
        match self {
            InputEvent::MouseMove { dx, dy, .. } => {
                delta_saturates(*dx) || delta_saturates(*dy)
            }
            _ => false,
        }
    }
}

/// Maps a position percentage onto the full `u16` range, truncating.
pub fn scale_position(pct: f64) -> u16 {
    (pct.clamp(0.0, 100.0) / 100.0 * 65535.0) as u16
}

fn raw_delta(pct: f64) -> f64 {
    (pct / 50.0 * 32768.0).trunc()
}

fn delta_saturates(pct: f64) -> bool {
    let raw = raw_delta(pct);
    raw > i16::MAX as f64 || raw < i16::MIN as f64
}

/// Maps a delta percentage with `pct / 50 * 32768`, clamped to `i16`.
///
/// Any `|pct| >= 50` in the positive direction reaches the clamp.
pub fn scale_delta(pct: f64) -> i16 {
    raw_delta(pct).clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn unscale_position(v: u16) -> f64 {
    v as f64 / 65535.0 * 100.0
}

fn unscale_delta(v: i16) -> f64 {
    v as f64 / 32768.0 * 50.0
}

/// Encodes one input event into its data channel frame.
pub fn encode_input(event: &InputEvent) -> Vec<u8> {
    match *event {
        InputEvent::Key { code, down: true } => vec![MessageType::KeyDown as u8, code, 0],
        InputEvent::Key { code, down: false } => vec![MessageType::KeyUp as u8, code],
        InputEvent::MouseButton { button, x, y, down } => {
            let tag = if down {
                MessageType::MouseDown
            } else {
                MessageType::MouseUp
            };
            let mut out = Vec::with_capacity(6);
            out.push(tag as u8);
            out.push(button as u8);
            out.extend_from_slice(&scale_position(x).to_le_bytes());
            out.extend_from_slice(&scale_position(y).to_le_bytes());
            out
        }
        InputEvent::MouseMove { x, y, dx, dy } => {
            let mut out = Vec::with_capacity(9);
            out.push(MessageType::MouseMove as u8);
            out.extend_from_slice(&scale_position(x).to_le_bytes());
            out.extend_from_slice(&scale_position(y).to_le_bytes());
            out.extend_from_slice(&scale_delta(dx).to_le_bytes());
            out.extend_from_slice(&scale_delta(dy).to_le_bytes());
            out
        }
    }
}

/// Decodes an input frame produced by [`encode_input`].
///
/// Percentages come back quantised to the wire resolution.
pub fn decode_input(frame: &[u8]) -> Result<InputEvent> {
    let (&tag, body) = frame
        .split_first()
        .ok_or_else(|| BridgeError::Decode("empty input frame".into()))?;

    let bad_len = |want: usize| {
        BridgeError::Decode(format!(
            "input frame tag {} expects {} payload bytes, got {}",
            tag,
            want,
            body.len()
        ))
    };
    let u16_at = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);
    let i16_at = |i: usize| i16::from_le_bytes([body[i], body[i + 1]]);

    match MessageType::from_u8(tag) {
        Some(MessageType::KeyDown) => match body {
            [code, 0] => Ok(InputEvent::Key {
                code: *code,
                down: true,
            }),
            _ => Err(bad_len(2)),
        },
        Some(MessageType::KeyUp) => match body {
            [code] => Ok(InputEvent::Key {
                code: *code,
                down: false,
            }),
            _ => Err(bad_len(1)),
        },
        Some(t @ (MessageType::MouseDown | MessageType::MouseUp)) => {
            if body.len() != 5 {
                return Err(bad_len(5));
            }
            let button = MouseButton::from_code(body[0])
                .ok_or_else(|| BridgeError::Decode(format!("unknown mouse button {}", body[0])))?;
            Ok(InputEvent::MouseButton {
                button,
                x: unscale_position(u16_at(1)),
                y: unscale_position(u16_at(3)),
                down: t == MessageType::MouseDown,
            })
        }
        Some(MessageType::MouseMove) => {
            if body.len() != 8 {
                return Err(bad_len(8));
            }
            Ok(InputEvent::MouseMove {
                x: unscale_position(u16_at(0)),
                y: unscale_position(u16_at(2)),
                dx: unscale_delta(i16_at(4)),
                dy: unscale_delta(i16_at(6)),
            })
        }
        _ => Err(BridgeError::Decode(format!(
            "no input decoder for tag {}",
            tag
        ))),
    }
}

/// Wraps text in a `UIInteraction` frame: tag, `u16` length, then each
/// character as a little-endian UTF-16 unit. For ASCII this is the character
/// byte followed by a zero byte.
pub fn encode_ui_interaction(text: &str) -> Result<Vec<u8>> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = u16::try_from(units.len()).map_err(|_| {
        BridgeError::Decode(format!(
            "ui interaction of {} characters does not fit a u16 length",
            units.len()
        ))
    })?;

    let mut out = Vec::with_capacity(3 + units.len() * 2);
    out.push(MessageType::UIInteraction as u8);
    out.extend_from_slice(&len.to_le_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// Reads the text back out of a `UIInteraction` frame.
pub fn decode_ui_interaction(frame: &[u8]) -> Result<String> {
    match frame {
        [tag, lo, hi, rest @ ..] if *tag == MessageType::UIInteraction as u8 => {
            let len = u16::from_le_bytes([*lo, *hi]) as usize;
            if rest.len() != len * 2 {
                return Err(BridgeError::Decode(format!(
                    "ui interaction declares {} characters but carries {} bytes",
                    len,
                    rest.len()
                )));
            }
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16(&units).map_err(|e| BridgeError::Decode(e.to_string()))
        }
        _ => Err(BridgeError::Decode("not a ui interaction frame".into())),
    }
}

/// Strips the marker byte and the zero padding off an inbound payload.
pub fn clean_inbound(payload: &[u8]) -> Result<String> {
    let (_marker, body) = payload
        .split_first()
        .ok_or_else(|| BridgeError::Decode("empty data channel payload".into()))?;
    let bytes: Vec<u8> = body.iter().copied().filter(|b| *b != 0).collect();
    String::from_utf8(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
}

/// Cleans an inbound payload and parses it as JSON.
pub fn decode_inbound(payload: &[u8]) -> Result<Value> {
    let text = clean_inbound(payload)?;
    serde_json::from_str(&text).map_err(|e| BridgeError::Decode(format!("{}: {}", e, text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widen(marker: u8, text: &str) -> Vec<u8> {
        let mut out = vec![marker];
        for b in text.bytes() {
            out.push(b);
            out.push(0);
        }
        out
    }

    #[test]
    fn key_down_has_trailing_pad() {
        let ev = InputEvent::Key {
            code: 65,
            down: true,
        };
        assert_eq!(encode_input(&ev), vec![60, 65, 0]);
    }

    #[test]
    fn key_up_has_no_pad() {
        let ev = InputEvent::Key {
            code: 65,
            down: false,
        };
        assert_eq!(encode_input(&ev), vec![61, 65]);
    }

    #[test]
    fn mouse_down_centre() {
        let ev = InputEvent::MouseButton {
            button: MouseButton::Left,
            x: 50.0,
            y: 50.0,
            down: true,
        };
        assert_eq!(encode_input(&ev), vec![72, 0, 255, 127, 255, 127]);
    }

    #[test]
    fn mouse_up_uses_its_own_tag() {
        let ev = InputEvent::MouseButton {
            button: MouseButton::Right,
            x: 0.0,
            y: 100.0,
            down: false,
        };
        assert_eq!(encode_input(&ev), vec![73, 2, 0, 0, 255, 255]);
    }

    #[test]
    fn mouse_move_layout() {
        let ev = InputEvent::MouseMove {
            x: 100.0,
            y: 0.0,
            dx: 25.0,
            dy: -25.0,
        };
        let bytes = encode_input(&ev);
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 74);
        assert_eq!(&bytes[1..3], &65535u16.to_le_bytes());
        assert_eq!(&bytes[3..5], &0u16.to_le_bytes());
        assert_eq!(&bytes[5..7], &16384i16.to_le_bytes());
        assert_eq!(&bytes[7..9], &(-16384i16).to_le_bytes());
    }

    #[test]
    fn position_boundaries() {
        assert_eq!(scale_position(0.0), 0);
        assert!((32767..=32768).contains(&scale_position(50.0)));
        assert_eq!(scale_position(100.0), 65535);
        assert_eq!(scale_position(150.0), 65535);
        assert_eq!(scale_position(-3.0), 0);
    }

    #[test]
    fn delta_boundaries_saturate() {
        assert_eq!(scale_delta(0.0), 0);
        assert_eq!(scale_delta(100.0), i16::MAX);
        assert_eq!(scale_delta(-100.0), i16::MIN);
        // 50% lands exactly on 32768, one past i16::MAX
        assert_eq!(scale_delta(50.0), i16::MAX);
        assert_eq!(scale_delta(-50.0), i16::MIN);

        let ev = InputEvent::MouseMove {
            x: 0.0,
            y: 0.0,
            dx: 100.0,
            dy: 0.0,
        };
        assert!(ev.saturates());
        let ev = InputEvent::MouseMove {
            x: 0.0,
            y: 0.0,
            dx: -50.0,
            dy: 10.0,
        };
        assert!(!ev.saturates());
    }

    #[test]
    fn input_round_trip() {
        let events = [
            InputEvent::Key {
                code: 9,
                down: true,
            },
            InputEvent::Key {
                code: 90,
                down: false,
            },
            InputEvent::MouseButton {
                button: MouseButton::Middle,
                x: 12.5,
                y: 87.0,
                down: true,
            },
            InputEvent::MouseMove {
                x: 33.0,
                y: 66.0,
                dx: -12.0,
                dy: 40.0,
            },
        ];

        for ev in events {
            let back = decode_input(&encode_input(&ev)).unwrap();
            match (&ev, &back) {
                (InputEvent::Key { .. }, _) => assert_eq!(ev, back),
                (
                    InputEvent::MouseButton {
                        button: b1,
                        x: x1,
                        y: y1,
                        down: d1,
                    },
                    InputEvent::MouseButton {
                        button: b2,
                        x: x2,
                        y: y2,
                        down: d2,
                    },
                ) => {
                    assert_eq!(b1, b2);
                    assert_eq!(d1, d2);
                    assert!((x1 - x2).abs() < 0.01);
                    assert!((y1 - y2).abs() < 0.01);
                }
                (
                    InputEvent::MouseMove {
                        x: x1,
                        y: y1,
                        dx: dx1,
                        dy: dy1,
                    },
                    InputEvent::MouseMove {
                        x: x2,
                        y: y2,
                        dx: dx2,
                        dy: dy2,
                    },
                ) => {
                    assert!((x1 - x2).abs() < 0.01);
                    assert!((y1 - y2).abs() < 0.01);
                    assert!((dx1 - dx2).abs() < 0.01);
                    assert!((dy1 - dy2).abs() < 0.01);
                }
                _ => panic!("variant changed: {:?} -> {:?}", ev, back),
            }
        }
    }

    fn assert_near(got: f64, want: f64, step: f64, what: &str) {
        assert!(
            (got - want).abs() <= step,
            "{}: decoded {} expected {} within {}",
            what,
            got,
            want,
            step
        );
    }

    #[test]
    fn round_trip_holds_across_the_range() {
        let pos_step = 100.0 / 65535.0;
        let delta_step = 50.0 / 32768.0;
        let expected_delta = |pct: f64| pct.clamp(-50.0, unscale_delta(i16::MAX));

        for x in 0..=100 {
            for y in 0..=100 {
                for button in [MouseButton::Left, MouseButton::Middle, MouseButton::Right] {
                    let ev = InputEvent::MouseButton {
                        button,
                        x: x as f64,
                        y: y as f64,
                        down: (x + y) % 2 == 0,
                    };
                    match decode_input(&encode_input(&ev)).unwrap() {
                        InputEvent::MouseButton {
                            button: b,
                            x: bx,
                            y: by,
                            down,
                        } => {
                            assert_eq!(b, button);
                            assert_eq!(down, (x + y) % 2 == 0);
                            assert_near(bx, x as f64, pos_step, "button x");
                            assert_near(by, y as f64, pos_step, "button y");
                        }
                        other => panic!("variant changed: {:?}", other),
                    }
                }
            }

            for dx in -100..=100 {
                let (y, dy) = (100 - x, -dx);
                let ev = InputEvent::MouseMove {
                    x: x as f64,
                    y: y as f64,
                    dx: dx as f64,
                    dy: dy as f64,
                };
                let clamped = |d: i32| !(-50..50).contains(&d);
                assert_eq!(ev.saturates(), clamped(dx) || clamped(dy), "{:?}", ev);

                match decode_input(&encode_input(&ev)).unwrap() {
                    InputEvent::MouseMove {
                        x: mx,
                        y: my,
                        dx: mdx,
                        dy: mdy,
                    } => {
                        assert_near(mx, x as f64, pos_step, "move x");
                        assert_near(my, y as f64, pos_step, "move y");
                        assert_near(mdx, expected_delta(dx as f64), delta_step, "move dx");
                        assert_near(mdy, expected_delta(dy as f64), delta_step, "move dy");
                    }
                    other => panic!("variant changed: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert!(decode_input(&[]).is_err());
        assert!(decode_input(&[72, 0, 1]).is_err());
        assert!(decode_input(&[60, 65]).is_err());
        assert!(decode_input(&[50, 1, 0]).is_err());
    }

    #[test]
    fn key_table_lookup() {
        assert_eq!(key_code("a"), Some(65));
        assert_eq!(key_code("tab"), Some(9));
        assert_eq!(key_code("nine"), Some(57));
        assert_eq!(key_code("escape"), None);
        assert_eq!(MouseButton::from_name("middle"), Some(MouseButton::Middle));
        assert_eq!(MouseButton::from_name("back"), None);
    }

    #[test]
    fn ui_interaction_pads_every_character() {
        let bytes = encode_ui_interaction("{\"a\":1}").unwrap();
        assert_eq!(bytes[0], 50);
        assert_eq!(&bytes[1..3], &7u16.to_le_bytes());
        assert_eq!(&bytes[3..7], &[b'{', 0, b'"', 0]);
        assert_eq!(bytes.len(), 3 + 14);
        assert_eq!(decode_ui_interaction(&bytes).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn inbound_strips_marker_and_zeros() {
        let payload = widen(1, r#"{"messageId":"3","ok":true}"#);
        let v = decode_inbound(&payload).unwrap();
        assert_eq!(v["messageId"], "3");
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn inbound_rejects_garbage() {
        assert!(decode_inbound(&[]).is_err());
        assert!(decode_inbound(&widen(1, "not json")).is_err());
        assert!(decode_inbound(&[1, 0xff, 0xfe]).is_err());
    }
}
