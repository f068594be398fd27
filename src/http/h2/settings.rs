//! SETTINGS parameters (RFC 7540 section 6.5)
//!
//! A session holds two [`Http2Settings`]: what this endpoint advertises and
//! what the peer advertised. Both start from [`Http2Settings::DEFAULT`].

use super::error::{Error, Result};
use std::fmt;

/// Identifiers known to this endpoint; others are ignored on receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

const NAMES: [&str; 6] = [
    "HEADER_TABLE_SIZE",
    "ENABLE_PUSH",
    "MAX_CONCURRENT_STREAMS",
    "INITIAL_WINDOW_SIZE",
    "MAX_FRAME_SIZE",
    "MAX_HEADER_LIST_SIZE",
];

impl SettingsParameter {
    /// Identifier order, which is also the order of the wire diff
    pub const ALL: [SettingsParameter; 6] = [
        SettingsParameter::HeaderTableSize,
        SettingsParameter::EnablePush,
        SettingsParameter::MaxConcurrentStreams,
        SettingsParameter::InitialWindowSize,
        SettingsParameter::MaxFrameSize,
        SettingsParameter::MaxHeaderListSize,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        let index = usize::from(value).checked_sub(1)?;
        Self::ALL.get(index).copied()
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.index()]
    }

    fn index(self) -> usize {
        self as usize - 1
    }

    /// Reject a value outside the legal range of this parameter.
    ///
    /// An oversized initial window is a flow control error, everything else
    /// a protocol error.
    pub fn check(self, value: u32) -> Result<()> {
        match self {
            SettingsParameter::EnablePush if value > 1 => {
                Err(Error::Protocol(format!("ENABLE_PUSH of {}", value)))
            }
            SettingsParameter::InitialWindowSize if value > MAX_WINDOW_SIZE => Err(
                Error::FlowControl(format!("INITIAL_WINDOW_SIZE of {} exceeds 2^31-1", value)),
            ),
            SettingsParameter::MaxFrameSize
                if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) =>
            {
                Err(Error::Protocol(format!(
                    "MAX_FRAME_SIZE of {} outside 16384..=16777215",
                    value
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// Largest legal window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Smallest legal SETTINGS_MAX_FRAME_SIZE
pub const MIN_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest legal SETTINGS_MAX_FRAME_SIZE (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// One complete set of HTTP/2 settings
///
/// Every parameter always has a value; parameters never sent keep their
/// RFC 7540 initial value from [`Http2Settings::DEFAULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    values: [u32; 6],
}

impl Http2Settings {
    /// Initial values defined by RFC 7540 Section 6.5.2
    ///
    /// Also the baseline the local SETTINGS frame is diffed against.
    pub const DEFAULT: Http2Settings = Http2Settings {
        values: [4096, 1, u32::MAX, 65_535, 16_384, u32::MAX],
    };

    /// Get a parameter value
    pub fn get(&self, parameter: SettingsParameter) -> u32 {
        self.values[parameter.index()]
    }

    /// Set a parameter, rejecting values outside its legal range
    pub fn set(&mut self, parameter: SettingsParameter, value: u32) -> Result<()> {
        parameter.check(value)?;
        self.values[parameter.index()] = value;
        Ok(())
    }

    /// Apply one (identifier, value) pair as received on the wire
    ///
    /// Unknown identifiers are ignored and reported as `Ok(None)`.
    pub fn apply(&mut self, identifier: u16, value: u32) -> Result<Option<SettingsParameter>> {
        match SettingsParameter::from_u16(identifier) {
            Some(parameter) => {
                self.set(parameter, value)?;
                Ok(Some(parameter))
            }
            None => Ok(None),
        }
    }

    /// Pairs whose value differs from `base`, in identifier order
    pub fn diff(&self, base: &Http2Settings) -> Vec<(SettingsParameter, u32)> {
        SettingsParameter::ALL
            .iter()
            .filter(|p| self.get(**p) != base.get(**p))
            .map(|p| (*p, self.get(*p)))
            .collect()
    }

    /// Validate every parameter
    pub fn validate(&self) -> Result<()> {
        for parameter in SettingsParameter::ALL {
            parameter.check(self.get(parameter))?;
        }
        Ok(())
    }

    pub fn header_table_size(&self) -> u32 {
        self.get(SettingsParameter::HeaderTableSize)
    }

    pub fn enable_push(&self) -> bool {
        self.get(SettingsParameter::EnablePush) == 1
    }

    /// `u32::MAX` when unlimited
    pub fn max_concurrent_streams(&self) -> u32 {
        self.get(SettingsParameter::MaxConcurrentStreams)
    }

    pub fn initial_window_size(&self) -> u32 {
        self.get(SettingsParameter::InitialWindowSize)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.get(SettingsParameter::MaxFrameSize)
    }

    /// `u32::MAX` when unlimited
    pub fn max_header_list_size(&self) -> u32 {
        self.get(SettingsParameter::MaxHeaderListSize)
    }
}

impl Default for Http2Settings {
    fn default() -> Self {
        Http2Settings::DEFAULT
    }
}

/// Builds local settings; out-of-range values surface from [`build`](Self::build)
pub struct SettingsBuilder {
    settings: Http2Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder starting from the RFC defaults
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Http2Settings::DEFAULT,
        }
    }

    fn with(mut self, parameter: SettingsParameter, value: u32) -> Self {
        self.settings.values[parameter.index()] = value;
        self
    }

    pub fn header_table_size(self, size: u32) -> Self {
        self.with(SettingsParameter::HeaderTableSize, size)
    }

    pub fn enable_push(self, enable: bool) -> Self {
        self.with(SettingsParameter::EnablePush, u32::from(enable))
    }

    pub fn max_concurrent_streams(self, max: u32) -> Self {
        self.with(SettingsParameter::MaxConcurrentStreams, max)
    }

    pub fn initial_window_size(self, size: u32) -> Self {
        self.with(SettingsParameter::InitialWindowSize, size)
    }

    pub fn max_frame_size(self, size: u32) -> Self {
        self.with(SettingsParameter::MaxFrameSize, size)
    }

    pub fn max_header_list_size(self, size: u32) -> Self {
        self.with(SettingsParameter::MaxHeaderListSize, size)
    }

    /// Build the settings
    pub fn build(self) -> Result<Http2Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::error::ErrorCode;

    #[test]
    fn test_settings_parameter_conversion() {
        assert_eq!(SettingsParameter::HeaderTableSize.as_u16(), 0x1);
        assert_eq!(SettingsParameter::EnablePush.as_u16(), 0x2);

        assert_eq!(
            SettingsParameter::from_u16(0x1),
            Some(SettingsParameter::HeaderTableSize)
        );
        assert_eq!(
            SettingsParameter::from_u16(0x6),
            Some(SettingsParameter::MaxHeaderListSize)
        );
        assert_eq!(SettingsParameter::from_u16(0xff), None);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Http2Settings::default();
        assert_eq!(settings.header_table_size(), 4096);
        assert!(settings.enable_push());
        assert_eq!(settings.max_concurrent_streams(), u32::MAX);
        assert_eq!(settings.initial_window_size(), 65535);
        assert_eq!(settings.max_frame_size(), 16384);
        assert_eq!(settings.max_header_list_size(), u32::MAX);
    }

    #[test]
    fn test_settings_builder() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .max_concurrent_streams(100)
            .initial_window_size(65535)
            .build()
            .unwrap();

        assert_eq!(settings.header_table_size(), 8192);
        assert!(!settings.enable_push());
        assert_eq!(settings.max_concurrent_streams(), 100);
        assert_eq!(settings.initial_window_size(), 65535);
    }

    #[test]
    fn test_settings_validation() {
        let settings = SettingsBuilder::new()
            .initial_window_size(65535)
            .max_frame_size(16384)
            .build();
        assert!(settings.is_ok());

        let err = SettingsBuilder::new()
            .initial_window_size(0x80000000)
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FlowControlError);

        let err = SettingsBuilder::new().max_frame_size(1024).build().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        assert!(SettingsBuilder::new().max_frame_size(16777216).build().is_err());
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut settings = Http2Settings::default();
        assert!(settings.set(SettingsParameter::EnablePush, 2).is_err());
        assert!(settings.enable_push());
        settings.set(SettingsParameter::EnablePush, 0).unwrap();
        assert!(!settings.enable_push());
    }

    #[test]
    fn test_apply_unknown_identifier() {
        let mut settings = Http2Settings::default();
        assert_eq!(settings.apply(0x8, 1).unwrap(), None);
        assert_eq!(settings.apply(0xff, 7).unwrap(), None);
        assert_eq!(settings, Http2Settings::DEFAULT);

        assert_eq!(
            settings.apply(0x3, 10).unwrap(),
            Some(SettingsParameter::MaxConcurrentStreams)
        );
        assert_eq!(settings.max_concurrent_streams(), 10);
    }

    #[test]
    fn test_apply_commutative_per_identifier() {
        let pairs = [(0x1u16, 8192u32), (0x3, 50), (0x4, 1000), (0x5, 32768)];

        let mut forward = Http2Settings::default();
        for (id, value) in pairs {
            forward.apply(id, value).unwrap();
        }

        let mut backward = Http2Settings::default();
        for (id, value) in pairs.iter().rev() {
            backward.apply(*id, *value).unwrap();
        }

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_diff_against_default() {
        assert!(Http2Settings::DEFAULT.diff(&Http2Settings::DEFAULT).is_empty());

        let settings = SettingsBuilder::new()
            .max_frame_size(32768)
            .max_concurrent_streams(100)
            .build()
            .unwrap();
        assert_eq!(
            settings.diff(&Http2Settings::DEFAULT),
            vec![
                (SettingsParameter::MaxConcurrentStreams, 100),
                (SettingsParameter::MaxFrameSize, 32768),
            ]
        );
    }
}
