//! Geographic locations and their bit-level codec.

use std::{borrow::Cow, fmt};

use bitbuff::{BitReader, BitWriter};

use crate::error::DbResult;

/// The separator between the fields of the location text form.
const FIELD_SEPARATOR: char = ';';

/// Number of bits used to encode a [`Provider`].
const PROVIDER_BITS: u32 = 2;

/// Where a location fix came from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Provider {
    #[default]
    Unknown = 0,
    Gps = 1,
    Network = 2,
    Manual = 3,
}

impl Provider {
    fn from_u8(tag: u8) -> Option<Provider> {
        match tag {
            0 => Some(Provider::Unknown),
            1 => Some(Provider::Gps),
            2 => Some(Provider::Network),
            3 => Some(Provider::Manual),
            _ => None,
        }
    }
}

/// A geographic location fix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    pub accuracy: Option<f32>,
    pub provider: Provider,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Location {
        Location {
            latitude,
            longitude,
            ..Location::default()
        }
    }

    pub fn has_altitude(&self) -> bool {
        self.altitude.is_some()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)?;
        if let Some(altitude) = self.altitude {
            write!(f, " @ {altitude}m")?;
        }
        Ok(())
    }
}

/// Which parts of a [`Location`] a column stores.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocationOpts {
    /// Store latitude, longitude and altitude as `f64` instead of `f32`.
    pub double_precision: bool,
    pub store_altitude: bool,
    pub store_bearing: bool,
    pub store_speed: bool,
    pub store_accuracy: bool,
    pub store_provider: bool,
}

impl LocationOpts {
    /// Options storing every part of a location, in double precision.
    pub fn full() -> LocationOpts {
        LocationOpts {
            double_precision: true,
            store_altitude: true,
            store_bearing: true,
            store_speed: true,
            store_accuracy: true,
            store_provider: true,
        }
    }

    fn coordinate_bits(&self) -> usize {
        if self.double_precision {
            64
        } else {
            32
        }
    }

    /// Returns a bit mask of the stored parts, used by the schema descriptors.
    pub(crate) fn to_flags(self) -> u8 {
        u8::from(self.double_precision)
            | u8::from(self.store_altitude) << 1
            | u8::from(self.store_bearing) << 2
            | u8::from(self.store_speed) << 3
            | u8::from(self.store_accuracy) << 4
            | u8::from(self.store_provider) << 5
    }

    pub(crate) fn from_flags(flags: u8) -> LocationOpts {
        LocationOpts {
            double_precision: flags & 1 != 0,
            store_altitude: flags & (1 << 1) != 0,
            store_bearing: flags & (1 << 2) != 0,
            store_speed: flags & (1 << 3) != 0,
            store_accuracy: flags & (1 << 4) != 0,
            store_provider: flags & (1 << 5) != 0,
        }
    }

    fn optional_parts(&self) -> [(bool, usize); 4] {
        let w = self.coordinate_bits();
        [
            (self.store_altitude, w),
            (self.store_bearing, 32),
            (self.store_speed, 32),
            (self.store_accuracy, 32),
        ]
    }

    pub fn minimum_size(&self) -> usize {
        let presence_bits = self.optional_parts().iter().filter(|(on, _)| *on).count();
        2 * self.coordinate_bits() + presence_bits + self.provider_bits()
    }

    pub fn maximum_size(&self) -> usize {
        let optional: usize = self
            .optional_parts()
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, bits)| 1 + bits)
            .sum();
        2 * self.coordinate_bits() + optional + self.provider_bits()
    }

    fn provider_bits(&self) -> usize {
        if self.store_provider {
            PROVIDER_BITS as usize
        } else {
            0
        }
    }

    pub fn validate(&self, location: &Location) -> Result<(), Cow<'static, str>> {
        if !(-90.0..=90.0).contains(&location.latitude) {
            return Err(format!("latitude {} out of range", location.latitude).into());
        }
        if !(-180.0..=180.0).contains(&location.longitude) {
            return Err(format!("longitude {} out of range", location.longitude).into());
        }
        if let Some(accuracy) = location.accuracy {
            if accuracy < 0.0 {
                return Err("negative accuracy".into());
            }
        }
        Ok(())
    }

    pub fn write(&self, location: &Location, buf: &mut BitWriter) {
        self.write_coordinate(location.latitude, buf);
        self.write_coordinate(location.longitude, buf);
        if self.store_altitude {
            buf.write(location.altitude.is_some());
            if let Some(altitude) = location.altitude {
                self.write_coordinate(altitude, buf);
            }
        }
        for (on, part) in [
            (self.store_bearing, location.bearing),
            (self.store_speed, location.speed),
            (self.store_accuracy, location.accuracy),
        ] {
            if on {
                buf.write(part.is_some());
                if let Some(part) = part {
                    buf.write(part);
                }
            }
        }
        if self.store_provider {
            buf.write_bits(location.provider as u64, PROVIDER_BITS);
        }
    }

    pub fn read(&self, buf: &mut BitReader<'_>) -> DbResult<Location> {
        let latitude = self.read_coordinate(buf)?;
        let longitude = self.read_coordinate(buf)?;
        let altitude = if self.store_altitude && buf.read::<bool>()? {
            Some(self.read_coordinate(buf)?)
        } else {
            None
        };
        let mut read_part = |on: bool| -> DbResult<Option<f32>> {
            if on && buf.read::<bool>()? {
                Ok(Some(buf.read::<f32>()?))
            } else {
                Ok(None)
            }
        };
        let bearing = read_part(self.store_bearing)?;
        let speed = read_part(self.store_speed)?;
        let accuracy = read_part(self.store_accuracy)?;
        let provider = if self.store_provider {
            // Two bits always map to a valid provider.
            Provider::from_u8(buf.read_bits(PROVIDER_BITS)? as u8).unwrap_or_default()
        } else {
            Provider::Unknown
        };
        Ok(Location {
            latitude,
            longitude,
            altitude,
            bearing,
            speed,
            accuracy,
            provider,
        })
    }

    fn write_coordinate(&self, value: f64, buf: &mut BitWriter) {
        if self.double_precision {
            buf.write(value);
        } else {
            buf.write(value as f32);
        }
    }

    fn read_coordinate(&self, buf: &mut BitReader<'_>) -> DbResult<f64> {
        Ok(if self.double_precision {
            buf.read::<f64>()?
        } else {
            f64::from(buf.read::<f32>()?)
        })
    }
}

/// Renders the `provider;lat;lon;alt;bearing;speed;accuracy` text form.
pub fn format(location: &Location) -> String {
    fn opt<T: ToString>(part: Option<T>) -> String {
        part.map(|p| p.to_string()).unwrap_or_default()
    }
    [
        (location.provider as u8).to_string(),
        location.latitude.to_string(),
        location.longitude.to_string(),
        opt(location.altitude),
        opt(location.bearing),
        opt(location.speed),
        opt(location.accuracy),
    ]
    .join(&FIELD_SEPARATOR.to_string())
}

/// Parses the text form produced by [`format`].
pub fn parse(src: &str) -> Result<Location, Cow<'static, str>> {
    let parts: Vec<&str> = src.split(FIELD_SEPARATOR).collect();
    let [provider, lat, lon, alt, bearing, speed, accuracy] = parts.as_slice() else {
        return Err(format!("expected 7 location fields, found {}", parts.len()).into());
    };

    fn num<T: std::str::FromStr>(part: &str, what: &str) -> Result<T, Cow<'static, str>> {
        part.trim()
            .parse()
            .map_err(|_| format!("invalid {what} `{part}`").into())
    }
    fn opt<T: std::str::FromStr>(part: &str, what: &str) -> Result<Option<T>, Cow<'static, str>> {
        if part.trim().is_empty() {
            Ok(None)
        } else {
            num(part, what).map(Some)
        }
    }

    let provider = Provider::from_u8(num(provider, "provider")?)
        .ok_or_else(|| Cow::from(format!("unknown provider `{provider}`")))?;
    Ok(Location {
        latitude: num(lat, "latitude")?,
        longitude: num(lon, "longitude")?,
        altitude: opt(alt, "altitude")?,
        bearing: opt(bearing, "bearing")?,
        speed: opt(speed, "speed")?,
        accuracy: opt(accuracy, "accuracy")?,
        provider,
    })
}
