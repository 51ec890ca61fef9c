use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Control Frame
// =============================================================================

/// Number of fields in a full action vector: two axes and fourteen buttons.
pub const FIELD_COUNT: usize = 16;

pub const AXIS_MIN: i32 = i8::MIN as i32;
pub const AXIS_MAX: i32 = i8::MAX as i32;

/// Controller buttons in action-vector order (after the two axes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Button {
    A = 0,
    B = 1,
    R = 2,
    L = 3,
    Z = 4,
    CRight = 5,
    CLeft = 6,
    CDown = 7,
    CUp = 8,
    DRight = 9,
    DLeft = 10,
    DDown = 11,
    DUp = 12,
    Start = 13,
}

impl Button {
    pub const ALL: [Button; 14] = [
        Button::A,
        Button::B,
        Button::R,
        Button::L,
        Button::Z,
        Button::CRight,
        Button::CLeft,
        Button::CDown,
        Button::CUp,
        Button::DRight,
        Button::DLeft,
        Button::DDown,
        Button::DUp,
        Button::Start,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Position of this button inside a full action vector.
    pub fn field_index(self) -> usize {
        2 + self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("action vector has {0} fields, at most 16 are allowed")]
    TooManyFields(usize),
    #[error("{axis} axis value {value} is outside [-128, 127]")]
    AxisOutOfRange { axis: &'static str, value: i32 },
    #[error("button {button:?} must be 0 or 1, got {value}")]
    ButtonNotBinary { button: Button, value: i32 },
}

/// One published controller state: two analog axes plus a button bitmask.
///
/// Serializes as the flat field-named record the input plugin expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "ControllerRecord", try_from = "ControllerRecord")]
pub struct ActionFrame {
    x_axis: i8,
    y_axis: i8,
    buttons: u16,
}

impl ActionFrame {
    pub const NOOP: ActionFrame = ActionFrame {
        x_axis: 0,
        y_axis: 0,
        buttons: 0,
    };

    pub fn new(x_axis: i8, y_axis: i8) -> Self {
        Self {
            x_axis,
            y_axis,
            buttons: 0,
        }
    }

    pub fn with_button(mut self, button: Button) -> Self {
        self.buttons |= button.bit();
        self
    }

    pub fn x_axis(&self) -> i8 {
        self.x_axis
    }

    pub fn y_axis(&self) -> i8 {
        self.y_axis
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.buttons & button.bit() != 0
    }

    /// Encodes an agent action vector.
    ///
    /// Vectors shorter than [`FIELD_COUNT`] are zero-padded, so titles that only
    /// drive `[X, Y, A, B, R]` can pass five fields.
    pub fn encode(action: &[i32]) -> Result<Self, ActionError> {
        if action.len() > FIELD_COUNT {
            return Err(ActionError::TooManyFields(action.len()));
        }
        let field = |i: usize| action.get(i).copied().unwrap_or(0);

        let x_axis = axis_value("x", field(0))?;
        let y_axis = axis_value("y", field(1))?;
        let mut frame = ActionFrame::new(x_axis, y_axis);
        for button in Button::ALL {
            match field(button.field_index()) {
                0 => {}
                1 => frame = frame.with_button(button),
                value => return Err(ActionError::ButtonNotBinary { button, value }),
            }
        }
        Ok(frame)
    }

    /// Inverse of [`ActionFrame::encode`], always producing a full vector.
    pub fn decode(&self) -> [i32; FIELD_COUNT] {
        let mut out = [0i32; FIELD_COUNT];
        out[0] = self.x_axis as i32;
        out[1] = self.y_axis as i32;
        for button in Button::ALL {
            out[button.field_index()] = self.is_pressed(button) as i32;
        }
        out
    }
}

fn axis_value(axis: &'static str, value: i32) -> Result<i8, ActionError> {
    i8::try_from(value).map_err(|_| ActionError::AxisOutOfRange { axis, value })
}

// =============================================================================
// Wire Record
// =============================================================================

/// Flat record served to the input plugin, one named field per control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    #[serde(rename = "X_AXIS")]
    pub x_axis: i32,
    #[serde(rename = "Y_AXIS")]
    pub y_axis: i32,
    #[serde(rename = "A_BUTTON")]
    pub a_button: u8,
    #[serde(rename = "B_BUTTON")]
    pub b_button: u8,
    #[serde(rename = "R_TRIG")]
    pub r_trig: u8,
    #[serde(rename = "L_TRIG")]
    pub l_trig: u8,
    #[serde(rename = "Z_TRIG")]
    pub z_trig: u8,
    #[serde(rename = "R_CBUTTON")]
    pub r_cbutton: u8,
    #[serde(rename = "L_CBUTTON")]
    pub l_cbutton: u8,
    #[serde(rename = "D_CBUTTON")]
    pub d_cbutton: u8,
    #[serde(rename = "U_CBUTTON")]
    pub u_cbutton: u8,
    #[serde(rename = "R_DPAD")]
    pub r_dpad: u8,
    #[serde(rename = "L_DPAD")]
    pub l_dpad: u8,
    #[serde(rename = "D_DPAD")]
    pub d_dpad: u8,
    #[serde(rename = "U_DPAD")]
    pub u_dpad: u8,
    #[serde(rename = "START_BUTTON")]
    pub start_button: u8,
}

impl From<ActionFrame> for ControllerRecord {
    fn from(frame: ActionFrame) -> Self {
        let b = |button: Button| frame.is_pressed(button) as u8;
        Self {
            x_axis: frame.x_axis as i32,
            y_axis: frame.y_axis as i32,
            a_button: b(Button::A),
            b_button: b(Button::B),
            r_trig: b(Button::R),
            l_trig: b(Button::L),
            z_trig: b(Button::Z),
            r_cbutton: b(Button::CRight),
            l_cbutton: b(Button::CLeft),
            d_cbutton: b(Button::CDown),
            u_cbutton: b(Button::CUp),
            r_dpad: b(Button::DRight),
            l_dpad: b(Button::DLeft),
            d_dpad: b(Button::DDown),
            u_dpad: b(Button::DUp),
            start_button: b(Button::Start),
        }
    }
}

impl TryFrom<ControllerRecord> for ActionFrame {
    type Error = ActionError;

    fn try_from(r: ControllerRecord) -> Result<Self, Self::Error> {
        let u = |v: u8| v as i32;
        ActionFrame::encode(&[
            r.x_axis,
            r.y_axis,
            u(r.a_button),
            u(r.b_button),
            u(r.r_trig),
            u(r.l_trig),
            u(r.z_trig),
            u(r.r_cbutton),
            u(r.l_cbutton),
            u(r.d_cbutton),
            u(r.u_cbutton),
            u(r.r_dpad),
            u(r.l_dpad),
            u(r.d_dpad),
            u(r.u_dpad),
            u(r.start_button),
        ])
    }
}

// =============================================================================
// Discrete Action Spaces
// =============================================================================

/// Steering actions for kart racing, `[X, Y, A, B, R]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KartAction {
    Noop,
    Straight,
    Brake,
    BackUp,
    SoftLeft,
    Left,
    HardLeft,
    ExtremeLeft,
    SoftRight,
    Right,
    HardRight,
    ExtremeRight,
}

impl KartAction {
    pub const COUNT: usize = 12;

    pub const ALL: [KartAction; Self::COUNT] = [
        KartAction::Noop,
        KartAction::Straight,
        KartAction::Brake,
        KartAction::BackUp,
        KartAction::SoftLeft,
        KartAction::Left,
        KartAction::HardLeft,
        KartAction::ExtremeLeft,
        KartAction::SoftRight,
        KartAction::Right,
        KartAction::HardRight,
        KartAction::ExtremeRight,
    ];

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    pub fn controls(self) -> [i32; 5] {
        match self {
            KartAction::Noop => [0, 0, 0, 0, 0],
            KartAction::Straight => [0, 0, 1, 0, 0],
            KartAction::Brake => [0, 0, 0, 1, 0],
            KartAction::BackUp => [0, -80, 0, 1, 0],
            KartAction::SoftLeft => [-20, 0, 1, 0, 0],
            KartAction::Left => [-40, 0, 1, 0, 0],
            KartAction::HardLeft => [-60, 0, 1, 0, 0],
            KartAction::ExtremeLeft => [-80, 0, 1, 0, 0],
            KartAction::SoftRight => [20, 0, 1, 0, 0],
            KartAction::Right => [40, 0, 1, 0, 0],
            KartAction::HardRight => [60, 0, 1, 0, 0],
            KartAction::ExtremeRight => [80, 0, 1, 0, 0],
        }
    }
}

/// Fighting-game action space: every stick magnitude pair crossed with one of
/// five button choices, plus grab and taunt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmashAction(usize);

const SMASH_STICK: [i32; 5] = [-120, -60, 0, 60, 120];
// A, B, R, L, Z, C-right
const SMASH_BUTTONS: [[i32; 6]; 5] = [
    [0, 0, 0, 0, 0, 0],
    [1, 0, 0, 0, 0, 0],
    [0, 1, 0, 0, 0, 0],
    [0, 0, 0, 0, 1, 0],
    [0, 0, 0, 0, 0, 1],
];

impl SmashAction {
    pub const COUNT: usize = SMASH_STICK.len() * SMASH_STICK.len() * SMASH_BUTTONS.len() + 2;
    pub const GRAB: SmashAction = SmashAction(Self::COUNT - 2);
    pub const TAUNT: SmashAction = SmashAction(Self::COUNT - 1);

    pub fn from_index(i: usize) -> Option<Self> {
        (i < Self::COUNT).then_some(SmashAction(i))
    }

    pub fn controls(self) -> [i32; 8] {
        if self == Self::GRAB {
            return [0, 0, 1, 0, 0, 0, 1, 0];
        }
        if self == Self::TAUNT {
            return [0, 0, 0, 0, 0, 1, 0, 0];
        }
        let per_x = SMASH_STICK.len() * SMASH_BUTTONS.len();
        let x = SMASH_STICK[self.0 / per_x];
        let y = SMASH_STICK[(self.0 % per_x) / SMASH_BUTTONS.len()];
        let buttons = SMASH_BUTTONS[self.0 % SMASH_BUTTONS.len()];
        let mut out = [0i32; 8];
        out[0] = x;
        out[1] = y;
        out[2..].copy_from_slice(&buttons);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn encode_pads_short_vectors() {
        let frame = ActionFrame::encode(&[-80, 0, 1, 0, 1]).unwrap();
        assert_eq!(frame.x_axis(), -80);
        assert!(frame.is_pressed(Button::A));
        assert!(frame.is_pressed(Button::R));
        assert!(!frame.is_pressed(Button::Start));
        assert_eq!(&frame.decode()[..5], &[-80, 0, 1, 0, 1]);
        assert!(frame.decode()[5..].iter().all(|&v| v == 0));
    }

    #[test]
    fn encode_rejects_invalid_fields() {
        assert_eq!(
            ActionFrame::encode(&[200, 0]),
            Err(ActionError::AxisOutOfRange {
                axis: "x",
                value: 200
            })
        );
        assert_eq!(
            ActionFrame::encode(&[0, 0, 2]),
            Err(ActionError::ButtonNotBinary {
                button: Button::A,
                value: 2
            })
        );
        assert_eq!(
            ActionFrame::encode(&[0; FIELD_COUNT + 1]),
            Err(ActionError::TooManyFields(FIELD_COUNT + 1))
        );
    }

    #[test]
    fn decode_inverts_encode_for_random_vectors() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..500 {
            let mut action = [0i32; FIELD_COUNT];
            action[0] = rng.random_range(AXIS_MIN..=AXIS_MAX);
            action[1] = rng.random_range(AXIS_MIN..=AXIS_MAX);
            for v in action.iter_mut().skip(2) {
                *v = rng.random_range(0..=1);
            }
            let frame = ActionFrame::encode(&action).unwrap();
            assert_eq!(frame.decode(), action);
            assert_eq!(ActionFrame::encode(&frame.decode()).unwrap(), frame);
        }
    }

    #[test]
    fn record_uses_plugin_field_names() {
        let frame = ActionFrame::new(10, -5)
            .with_button(Button::Start)
            .with_button(Button::CUp);
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["X_AXIS"], 10);
        assert_eq!(json["Y_AXIS"], -5);
        assert_eq!(json["START_BUTTON"], 1);
        assert_eq!(json["U_CBUTTON"], 1);
        assert_eq!(json["A_BUTTON"], 0);

        let back: ActionFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn smash_table_has_grab_and_taunt_last() {
        assert_eq!(SmashAction::COUNT, 127);
        let taunt = ActionFrame::encode(&SmashAction::TAUNT.controls()).unwrap();
        assert!(taunt.is_pressed(Button::L));
        let grab = ActionFrame::encode(&SmashAction::GRAB.controls()).unwrap();
        assert!(grab.is_pressed(Button::A) && grab.is_pressed(Button::Z));

        let first = SmashAction::from_index(0).unwrap().controls();
        assert_eq!(first, [-120, -120, 0, 0, 0, 0, 0, 0]);
        let c_button = SmashAction::from_index(4).unwrap().controls();
        assert_eq!(c_button[7], 1);
        assert!(SmashAction::from_index(SmashAction::COUNT).is_none());
    }

    #[test]
    fn kart_actions_all_encode() {
        for action in KartAction::ALL {
            assert!(ActionFrame::encode(&action.controls()).is_ok());
        }
        assert_eq!(KartAction::from_index(7), Some(KartAction::ExtremeLeft));
    }
}
