//! # Input Commands and Delta Encoding
//!
//! Per-tick input is a fixed record: six signed 16-bit axes and a 29-bit
//! button mask. On the wire it is always sent relative to the same player's
//! previous command.
//!
//! ## Delta layout
//!
//! ```text
//! ┌───────────┬──────────────────────────┬──────────────────────┐
//! │ flags (1) │ changed axes (2 B each)  │ buttons (1-4 B)      │
//! └───────────┴──────────────────────────┴──────────────────────┘
//!   bit 0-5: axis changed   bit 6: buttons changed   bit 7: reserved
//! ```
//!
//! Buttons use a 7-bit continuation encoding for the first three bytes;
//! the fourth byte, when present, carries the top 8 bits whole.

use crate::codec::{CodecError, CodecResult, Serializer};

/// Number of analog axes in a command.
pub const AXIS_COUNT: usize = 6;

/// Pitch axis index.
pub const AXIS_PITCH: usize = 0;
/// Yaw axis index.
pub const AXIS_YAW: usize = 1;
/// Roll axis index.
pub const AXIS_ROLL: usize = 2;
/// Forward movement axis index.
pub const AXIS_FORWARD: usize = 3;
/// Sideways movement axis index.
pub const AXIS_SIDE: usize = 4;
/// Vertical movement axis index.
pub const AXIS_UP: usize = 5;

/// Width of the button mask in bits.
pub const BUTTON_BITS: u32 = 29;

/// Mask of the valid button bits.
pub const BUTTON_MASK: u32 = (1 << BUTTON_BITS) - 1;

const FLAG_BUTTONS: u8 = 1 << 6;
const FLAG_RESERVED: u8 = 1 << 7;

/// One participant's input for one network tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InputCommand {
    /// Button mask; only the low [`BUTTON_BITS`] bits are meaningful.
    pub buttons: u32,
    /// Analog axes, indexed by the `AXIS_*` constants.
    pub axes: [i16; AXIS_COUNT],
}

impl InputCommand {
    /// Primary action button.
    pub const BUTTON_ATTACK: u32 = 1 << 0;
    /// Use/interact button.
    pub const BUTTON_USE: u32 = 1 << 1;
    /// Jump button.
    pub const BUTTON_JUMP: u32 = 1 << 2;
    /// Crouch button.
    pub const BUTTON_CROUCH: u32 = 1 << 3;

    /// A command with no input.
    pub const NEUTRAL: Self = Self {
        buttons: 0,
        axes: [0; AXIS_COUNT],
    };

    /// Builds a command from buttons and axes, masking stray button bits.
    #[must_use]
    pub const fn new(buttons: u32, axes: [i16; AXIS_COUNT]) -> Self {
        Self {
            buttons: buttons & BUTTON_MASK,
            axes,
        }
    }
}

/// Difference between a command and its basis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandDelta {
    flags: u8,
    buttons: u32,
    axes: [i16; AXIS_COUNT],
}

impl CommandDelta {
    /// Computes the delta that turns `basis` into `command`.
    #[must_use]
    pub fn between(basis: &InputCommand, command: &InputCommand) -> Self {
        let mut delta = Self::default();
        for axis in 0..AXIS_COUNT {
            if command.axes[axis] != basis.axes[axis] {
                delta.flags |= 1 << axis;
                delta.axes[axis] = command.axes[axis];
            }
        }
        let buttons = command.buttons & BUTTON_MASK;
        if buttons != basis.buttons & BUTTON_MASK {
            delta.flags |= FLAG_BUTTONS;
            delta.buttons = buttons;
        }
        delta
    }

    /// Applies the delta on top of `basis`.
    #[must_use]
    pub fn apply(&self, basis: &InputCommand) -> InputCommand {
        let mut out = *basis;
        for axis in 0..AXIS_COUNT {
            if self.flags & (1 << axis) != 0 {
                out.axes[axis] = self.axes[axis];
            }
        }
        if self.flags & FLAG_BUTTONS != 0 {
            out.buttons = self.buttons;
        }
        out
    }

    /// True when nothing changed.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.flags == 0
    }

    /// Bytes this delta occupies on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let axes = (self.flags & 0x3F).count_ones() as usize * 2;
        let buttons = if self.flags & FLAG_BUTTONS == 0 {
            0
        } else {
            button_len(self.buttons)
        };
        1 + axes + buttons
    }

    /// Serializes the delta in any direction.
    pub fn serialize<S: Serializer>(&mut self, s: &mut S) -> CodecResult<()> {
        s.u8(&mut self.flags)?;
        if self.flags & FLAG_RESERVED != 0 {
            return Err(CodecError::InvalidValue {
                what: "command flags",
                value: u64::from(self.flags),
            });
        }
        for axis in 0..AXIS_COUNT {
            if self.flags & (1 << axis) != 0 {
                s.i16(&mut self.axes[axis])?;
            }
        }
        if self.flags & FLAG_BUTTONS != 0 {
            serialize_buttons(s, &mut self.buttons)?;
        }
        Ok(())
    }
}

fn button_len(buttons: u32) -> usize {
    match buttons & BUTTON_MASK {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

fn serialize_buttons<S: Serializer>(s: &mut S, buttons: &mut u32) -> CodecResult<()> {
    if s.is_decoding() {
        let mut value = 0u32;
        for shift in [0u32, 7, 14] {
            let mut byte = 0u8;
            s.u8(&mut byte)?;
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                *buttons = value;
                return Ok(());
            }
        }
        let mut top = 0u8;
        s.u8(&mut top)?;
        *buttons = (value | (u32::from(top) << 21)) & BUTTON_MASK;
        return Ok(());
    }

    let value = *buttons & BUTTON_MASK;
    let len = button_len(value);
    for index in 0..len.min(3) {
        let shift = 7 * index as u32;
        let mut byte = ((value >> shift) & 0x7F) as u8;
        if index + 1 < len {
            byte |= 0x80;
        }
        s.u8(&mut byte)?;
    }
    if len == 4 {
        let mut top = (value >> 21) as u8;
        s.u8(&mut top)?;
    }
    Ok(())
}

/// Collapses one network tick's worth of sampled commands into one.
///
/// Axes are averaged (truncating toward zero) and buttons are OR-ed. The
/// collapsed command is written back over every sample so local prediction
/// sees exactly what the network will carry.
pub fn collapse_ticdup(samples: &mut [InputCommand]) -> InputCommand {
    if samples.is_empty() {
        return InputCommand::NEUTRAL;
    }
    let count = samples.len() as i32;
    let mut sums = [0i32; AXIS_COUNT];
    let mut buttons = 0u32;
    for sample in samples.iter() {
        for (sum, &axis) in sums.iter_mut().zip(&sample.axes) {
            *sum += i32::from(axis);
        }
        buttons |= sample.buttons;
    }
    let mut collapsed = InputCommand::new(buttons, [0; AXIS_COUNT]);
    for (axis, sum) in collapsed.axes.iter_mut().zip(sums) {
        // An average of i16 values always fits in i16.
        *axis = (sum / count) as i16;
    }
    samples.fill(collapsed);
    collapsed
}
