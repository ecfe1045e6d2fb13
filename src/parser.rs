//! Parser for RBN (Reverse Beacon Network) spot messages.
//!
//! This module uses the `nom` parsing library to parse DX cluster spot messages
//! from the RBN telnet feed. The parser has no state and can be called from
//! any number of threads.
//!
//! # Spot Format
//!
//! RBN spots follow this general format:
//! ```text
//! DX de SPOTTER:  FREQ  CALLSIGN  MODE  SNR dB  WPM WPM  [TYPE]  [TIMEZ]
//! ```
//!
//! Example:
//! ```text
//! DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z
//! ```
//!
//! Everything after the `WPM` marker is optional. A trailing `HHMMZ` token is
//! kept as the reported time; anything else there is ignored.

use chrono::NaiveTime;
use nom::{
    IResult, Parser,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, multispace1, space1},
    combinator::{map_res, opt, recognize, value},
    sequence::terminated,
};
use std::time::Instant;
use thiserror::Error;

use crate::spot::{Mode, RawSpot};

/// Prefix that starts every report line.
pub const SPOT_PREFIX: &str = "DX de";

/// Errors that can occur during parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid spot format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Check if a character is valid in a callsign.
///
/// Valid callsign characters are alphanumeric plus `/` for portable designators
/// and `-` for suffixes like `-#` on RBN spotters.
fn is_callsign_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/' || c == '-' || c == '#'
}

/// Parse the "DX de " prefix that starts every spot line.
fn parse_dx_de_prefix(input: &str) -> IResult<&str, ()> {
    value(
        (),
        (
            tag_no_case("DX"),
            multispace1,
            tag_no_case("de"),
            multispace1,
        ),
    )
    .parse(input)
}

/// Parse a callsign (spotter or DX station).
fn parse_callsign(input: &str) -> IResult<&str, &str> {
    take_while1(is_callsign_char).parse(input)
}

/// Parse the spotter callsign followed by a colon.
fn parse_spotter(input: &str) -> IResult<&str, &str> {
    terminated(parse_callsign, char(':')).parse(input)
}

/// Parse a floating-point frequency in kHz.
fn parse_frequency(input: &str) -> IResult<&str, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Parse the transmission mode token.
fn parse_mode(input: &str) -> IResult<&str, Mode> {
    let (input, token) = take_while1(|c: char| c.is_ascii_alphanumeric()).parse(input)?;
    Ok((input, Mode::from_token(token)))
}

/// Parse the signal-to-noise ratio (e.g., "19 dB" or "-5 dB").
fn parse_snr(input: &str) -> IResult<&str, i32> {
    terminated(
        map_res(recognize((opt(char('-')), digit1)), |s: &str| {
            s.parse::<i32>()
        }),
        (space1, tag_no_case("dB")),
    )
    .parse(input)
}

/// Parse the CW speed in WPM (e.g., "18 WPM").
fn parse_wpm(input: &str) -> IResult<&str, u16> {
    terminated(
        map_res(digit1, |s: &str| s.parse::<u16>()),
        (space1, tag_no_case("WPM")),
    )
    .parse(input)
}

/// Parse the full UTC time from a 4-digit string like "2259Z".
fn parse_time_full(input: &str) -> IResult<&str, NaiveTime> {
    map_res(
        terminated(take_while1(|c: char| c.is_ascii_digit()), tag_no_case("Z")),
        |s: &str| {
            if s.len() != 4 {
                return Err("Time must be 4 digits");
            }
            let hour: u32 = s[0..2].parse().map_err(|_| "Invalid hour")?;
            let min: u32 = s[2..4].parse().map_err(|_| "Invalid minute")?;
            NaiveTime::from_hms_opt(hour, min, 0).ok_or("Invalid time values")
        },
    )
    .parse(input)
}

/// Pick the reported time out of whatever follows the WPM marker.
fn parse_trailer_time(rest: &str) -> Option<NaiveTime> {
    let token = rest.split_whitespace().last()?;
    match parse_time_full(token) {
        Ok(("", time)) => Some(time),
        _ => None,
    }
}

struct SpotFields<'a> {
    spotter: &'a str,
    frequency_khz: f64,
    dx_call: &'a str,
    mode: Mode,
    snr_db: i32,
    wpm: u16,
}

/// Parse the fields up to and including the WPM marker.
fn parse_fields(input: &str) -> IResult<&str, SpotFields<'_>> {
    let (input, _) = parse_dx_de_prefix(input)?;
    let (input, spotter) = parse_spotter(input)?;
    let (input, _) = space1(input)?;
    let (input, frequency_khz) = parse_frequency(input)?;
    let (input, _) = space1(input)?;
    let (input, dx_call) = parse_callsign(input)?;
    let (input, _) = space1(input)?;
    let (input, mode) = parse_mode(input)?;
    let (input, _) = space1(input)?;
    let (input, snr_db) = parse_snr(input)?;
    let (input, _) = space1(input)?;
    let (input, wpm) = parse_wpm(input)?;

    Ok((
        input,
        SpotFields {
            spotter,
            frequency_khz,
            dx_call,
            mode,
            snr_db,
            wpm,
        },
    ))
}

/// Parse a complete RBN spot line, stamping it with `received`.
pub fn parse_spot_at(input: &str, received: Instant) -> ParseResult<RawSpot> {
    let input = input.trim();
    let (rest, fields) =
        parse_fields(input).map_err(|e| ParseError::InvalidFormat(format!("{:?}", e)))?;

    // Anything glued to the WPM marker (e.g. "18 WPMX") is not the marker.
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return Err(ParseError::InvalidFormat(format!(
            "unexpected text after WPM: {}",
            rest
        )));
    }

    let spotter = fields.spotter.trim_end_matches(['-', '#', ':']);
    if spotter.is_empty() {
        return Err(ParseError::MissingField("spotter"));
    }

    Ok(RawSpot {
        spotter: spotter.to_string(),
        dx_call: fields.dx_call.to_string(),
        frequency_khz: fields.frequency_khz,
        snr_db: fields.snr_db,
        wpm: fields.wpm,
        mode: fields.mode,
        reported_time: parse_trailer_time(rest),
        timestamp: received,
    })
}

/// Parse a complete RBN spot line.
///
/// # Example
///
/// ```
/// use rbn_vfd::parser::parse_spot;
///
/// let line = "DX de EA5WU-#:    7018.3  RW1M           CW    19 dB  18 WPM  CQ      2259Z";
/// let spot = parse_spot(line).unwrap();
/// assert_eq!(spot.spotter, "EA5WU");
/// assert_eq!(spot.dx_call, "RW1M");
/// ```
pub fn parse_spot(input: &str) -> ParseResult<RawSpot> {
    parse_spot_at(input, Instant::now())
}

/// Check if a line looks like a spot (quick pre-filter).
///
/// This is a fast check to avoid running the full parser on non-spot lines.
#[inline]
pub fn looks_like_spot(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() <= 20 {
        return false;
    }
    // Same rule as the grammar: any case, any whitespace between the words
    let mut words = trimmed.split_whitespace();
    SPOT_PREFIX
        .split(' ')
        .all(|word| words.next().is_some_and(|w| w.eq_ignore_ascii_case(word)))
}
