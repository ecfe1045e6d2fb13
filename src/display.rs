//! Two-line VFD rendering.
//!
//! [`format_spot`] turns one aggregated spot into a fixed-width line,
//! [`Rotation`] decides which spots fill the two lines on each tick, and
//! [`VfdDisplay`] owns the serial device and writes frames to it.
//!
//! The device protocol is minimal: `0x0C` clears the screen and homes the
//! cursor, and `1F 24 x y` moves the cursor to column `x`, row `y` (1-based).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::spot::AggregatedSpot;

/// Characters per line on the physical display.
pub const DISPLAY_WIDTH: usize = 20;

/// Serial speed of the display. Framing is always 8N1.
pub const BAUD_RATE: u32 = 9600;

/// Clear the screen and home the cursor.
pub const CLEAR_HOME: &[u8] = &[0x0C];

/// Move the cursor to the start of line 1.
pub const LINE1_POSITION: &[u8] = &[0x1F, 0x24, 0x01, 0x01];

/// Move the cursor to the start of line 2.
pub const LINE2_POSITION: &[u8] = &[0x1F, 0x24, 0x01, 0x02];

/// Shown on line 1 when no spot passes the filter.
pub const NO_DATA_TEXT: &str = "No spots";

/// Order of the fields on a rendered line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineLayout {
    /// `14033.0 WO6W 24`
    #[default]
    FreqCallSpeed,
    /// `14033.0 24 WO6W`
    FreqSpeedCall,
}

/// Errors from the output device.
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("Failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Write to {port} failed: {source}")]
    Write {
        port: String,
        #[source]
        source: io::Error,
    },
}

/// Pad or cut `text` to exactly `width` ASCII bytes.
///
/// Non-ASCII characters are replaced with `?` so the byte count always
/// equals the character count.
pub fn pad_line(text: &str, width: usize) -> String {
    let mut line: String = text
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .take(width)
        .collect();
    while line.len() < width {
        line.push(' ');
    }
    line
}

/// Render one spot into exactly `width` characters.
///
/// Frequency has one decimal place and speed is rounded to an integer. Only
/// the callsign is cut when the line is too long.
pub fn format_spot(spot: &AggregatedSpot, width: usize, layout: LineLayout) -> String {
    let freq = format!("{:.1}", spot.frequency_khz);
    let speed = format!("{}", spot.average_wpm.round() as i64);

    let call_budget = width.saturating_sub(freq.len() + speed.len() + 2);
    let call: String = spot.dx_call.chars().take(call_budget).collect();

    let fields = match layout {
        LineLayout::FreqCallSpeed => [freq.as_str(), call.as_str(), speed.as_str()],
        LineLayout::FreqSpeedCall => [freq.as_str(), speed.as_str(), call.as_str()],
    };
    let text = fields
        .iter()
        .filter(|f| !f.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    pad_line(&text, width)
}

/// The two lines of a display frame, each exactly the display width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub lines: [String; 2],
}

impl DisplayFrame {
    pub fn new(line1: &str, line2: &str, width: usize) -> Self {
        Self {
            lines: [pad_line(line1, width), pad_line(line2, width)],
        }
    }

    pub fn blank(width: usize) -> Self {
        Self::new("", "", width)
    }

    /// The bytes written to the device for this frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            CLEAR_HOME.len()
                + LINE1_POSITION.len()
                + LINE2_POSITION.len()
                + 2 * self.lines[0].len(),
        );
        bytes.extend_from_slice(CLEAR_HOME);
        bytes.extend_from_slice(LINE1_POSITION);
        bytes.extend_from_slice(self.lines[0].as_bytes());
        bytes.extend_from_slice(LINE2_POSITION);
        bytes.extend_from_slice(self.lines[1].as_bytes());
        bytes
    }
}

impl fmt::Display for DisplayFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}]", self.lines[0])?;
        write!(f, "[{}]", self.lines[1])
    }
}

/// Picks which spots to show on each tick.
#[derive(Debug, Default)]
pub struct Rotation {
    cursor: usize,
}

impl Rotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Build the next frame from a frequency-ordered snapshot.
    ///
    /// With three or more spots the two lines show consecutive spots and the
    /// cursor advances one step per call, wrapping at the snapshot length.
    pub fn next_frame(
        &mut self,
        spots: &[AggregatedSpot],
        width: usize,
        layout: LineLayout,
    ) -> DisplayFrame {
        let line = |spot: &AggregatedSpot| format_spot(spot, width, layout);
        match spots {
            [] => DisplayFrame::new(NO_DATA_TEXT, "", width),
            [only] => DisplayFrame::new(&line(only), "", width),
            [first, second] => DisplayFrame::new(&line(first), &line(second), width),
            _ => {
                let n = spots.len();
                let first = self.cursor % n;
                let second = (first + 1) % n;
                self.cursor = second;
                DisplayFrame::new(&line(&spots[first]), &line(&spots[second]), width)
            }
        }
    }
}

/// The VFD on a serial port.
///
/// Keeps the last frame as a preview whether or not a device is attached.
pub struct VfdDisplay {
    port: Option<Box<dyn Write + Send>>,
    port_name: String,
    width: usize,
    preview: DisplayFrame,
}

impl VfdDisplay {
    pub fn new(width: usize) -> Self {
        Self {
            port: None,
            port_name: String::new(),
            width,
            preview: DisplayFrame::blank(width),
        }
    }

    /// Names of serial ports present on this machine.
    pub fn available_ports() -> Vec<String> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.port_name)
            .collect()
    }

    /// Open a serial port as 8N1 at `baud_rate`, replacing any open device.
    pub fn open(&mut self, port_name: &str, baud_rate: u32) -> Result<(), DisplayError> {
        self.close();

        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(1000))
            .open()
            .map_err(|source| DisplayError::Open {
                port: port_name.to_string(),
                source,
            })?;

        self.attach(port_name, Box::new(port))
    }

    /// Use an already open writer as the device.
    pub fn attach(
        &mut self,
        port_name: &str,
        port: Box<dyn Write + Send>,
    ) -> Result<(), DisplayError> {
        self.close();
        self.port = Some(port);
        self.port_name = port_name.to_string();
        info!("VFD opened on {}", port_name);
        self.blank()
    }

    /// Blank the device and drop it.
    pub fn close(&mut self) {
        if self.port.is_some() {
            info!("Closing VFD on {}", self.port_name);
            // Best effort; the port is going away either way
            let _ = self.blank();
        }
        self.port = None;
        self.port_name.clear();
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// The last frame shown or computed.
    pub fn preview(&self) -> &DisplayFrame {
        &self.preview
    }

    /// Clear the screen and the preview.
    pub fn blank(&mut self) -> Result<(), DisplayError> {
        self.preview = DisplayFrame::blank(self.width);
        self.write_bytes(CLEAR_HOME)
    }

    /// Record `frame` as the preview and write it if a device is open.
    ///
    /// Returns whether bytes were written. A failed write drops the device.
    pub fn show(&mut self, frame: DisplayFrame) -> Result<bool, DisplayError> {
        let bytes = frame.to_bytes();
        self.preview = frame;
        if self.port.is_none() {
            return Ok(false);
        }
        self.write_bytes(&bytes)?;
        Ok(true)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), DisplayError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };
        let result = port.write_all(bytes).and_then(|_| port.flush());
        if let Err(source) = result {
            let port = std::mem::take(&mut self.port_name);
            self.port = None;
            debug!("Dropped VFD on {} after write error", port);
            return Err(DisplayError::Write { port, source });
        }
        Ok(())
    }
}

impl fmt::Debug for VfdDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfdDisplay")
            .field("port_name", &self.port_name)
            .field("open", &self.is_open())
            .field("width", &self.width)
            .finish()
    }
}
