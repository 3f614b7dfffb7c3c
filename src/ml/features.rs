//! Feature encoding for the demand models
//!
//! Raw records become positional feature vectors here. The field order of a
//! vector is part of the contract with the fitted scaler and the model
//! weights: both are indexed by position, never by name.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while turning a raw record into features
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    /// A categorical value outside its closed enumeration
    #[error("unknown {field} category: {value:?}")]
    UnknownCategory { field: &'static str, value: String },
    /// A continuous field that is NaN or infinite
    #[error("feature {field} is not a finite number: {value}")]
    NonFinite { field: &'static str, value: f64 },
    /// A timestamp that could not be parsed
    #[error("invalid timestamp {value:?}")]
    InvalidTimestamp { value: String },
}

/// Declares a closed categorical enumeration with its integer codes.
///
/// The first label of each variant is its canonical name; further labels are
/// accepted aliases. Anything else parses to `FeatureError::UnknownCategory`.
macro_rules! closed_category {
    (
        $(#[$meta:meta])*
        $name:ident, field = $field:literal {
            $($variant:ident = $code:literal => $label:literal $(| $alias:literal)*,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Every variant, in code order
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Integer code fed to the models
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            /// Canonical label
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = FeatureError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label $(| $alias)* => Ok($name::$variant),)+
                    _ => Err(FeatureError::UnknownCategory {
                        field: $field,
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let label = String::deserialize(deserializer)?;
                label.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

closed_category! {
    /// Meteorological season of the hourly corpus
    Season, field = "season" {
        Spring = 1 => "spring" | "1",
        Summer = 2 => "summer" | "2",
        Fall = 3 => "fall" | "3",
        Winter = 4 => "winter" | "4",
    }
}

closed_category! {
    /// Weather situation of the hourly corpus
    WeatherSituation, field = "weather" {
        Clear = 1 => "clear" | "1",
        Mist = 2 => "mist" | "2",
        LightPrecipitation = 3 => "light_precipitation" | "3",
        HeavyPrecipitation = 4 => "heavy_precipitation" | "4",
    }
}

closed_category! {
    /// Dispatch period of the day
    TimePeriod, field = "time_period" {
        Morning = 0 => "morning",
        Noon = 1 => "noon",
        Evening = 2 => "evening",
        Night = 3 => "night",
    }
}

closed_category! {
    /// Operating region
    Region, field = "region" {
        Region1 = 0 => "region1",
        Region2 = 1 => "region2",
        Region3 = 2 => "region3",
        Region4 = 3 => "region4",
    }
}

closed_category! {
    /// Weather type recorded with rides and dispatch queries
    WeatherType, field = "weather_type" {
        Sunny = 0 => "sunny",
        Rainy = 1 => "rainy",
        Cloudy = 2 => "cloudy",
    }
}

impl TimePeriod {
    /// Hours covered by each period: `[start, start + 2)`
    const SPAN_HOURS: u32 = 2;

    /// First hour of the period
    pub fn start_hour(self) -> u32 {
        match self {
            TimePeriod::Morning => 7,
            TimePeriod::Noon => 11,
            TimePeriod::Evening => 17,
            TimePeriod::Night => 21,
        }
    }

    /// Period containing the given hour, if any
    pub fn from_hour(hour: u32) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| (p.start_hour()..p.start_hour() + Self::SPAN_HOURS).contains(&hour))
    }
}

/// Which positional layout a feature vector follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureLayout {
    /// Hourly weather corpus (11 features)
    Hourly,
    /// Aggregated dispatch slots (7 features)
    Slot,
}

impl FeatureLayout {
    /// Feature names in vector order
    pub fn feature_names(self) -> &'static [&'static str] {
        match self {
            FeatureLayout::Hourly => &HourlyRecord::FEATURE_NAMES,
            FeatureLayout::Slot => &DemandSlot::FEATURE_NAMES,
        }
    }

    /// Width of the feature vector
    pub fn len(self) -> usize {
        self.feature_names().len()
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Layout whose vectors have the given width
    pub fn from_width(width: usize) -> Option<Self> {
        [FeatureLayout::Hourly, FeatureLayout::Slot]
            .into_iter()
            .find(|layout| layout.len() == width)
    }
}

/// Hour of day, weekday (Monday = 0) and month decomposed from a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParts {
    pub hour: u32,
    pub weekday: u32,
    pub month: u32,
}

impl From<NaiveDateTime> for TimeParts {
    fn from(ts: NaiveDateTime) -> Self {
        Self {
            hour: ts.hour(),
            weekday: ts.weekday().num_days_from_monday(),
            month: ts.month(),
        }
    }
}

/// Parse the timestamp formats found in exported corpora
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, FeatureError> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M"))
        .or_else(|_| {
            chrono::DateTime::parse_from_rfc3339(trimmed).map(|dt| dt.naive_utc())
        })
        .map_err(|_| FeatureError::InvalidTimestamp {
            value: value.to_string(),
        })
}

/// Parse a 0/1 flag column
fn parse_flag(field: &'static str, value: &str) -> Result<bool, FeatureError> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(FeatureError::UnknownCategory {
            field,
            value: other.to_string(),
        }),
    }
}

fn ensure_finite(field: &'static str, value: f64) -> Result<f64, FeatureError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FeatureError::NonFinite { field, value })
    }
}

// ==================== Hourly corpus ====================

/// One row of the hourly weather corpus as it appears on disk
#[derive(Debug, Clone, Deserialize)]
pub struct RawHourlyRecord {
    pub datetime: String,
    pub season: String,
    pub holiday: String,
    pub workingday: String,
    pub weather: String,
    pub temp: f64,
    pub atemp: f64,
    pub humidity: f64,
    pub windspeed: f64,
    pub count: f64,
}

/// A validated hourly observation with its demand target
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyRecord {
    pub timestamp: NaiveDateTime,
    pub season: Season,
    pub holiday: bool,
    pub working_day: bool,
    pub weather: WeatherSituation,
    pub temperature: f64,
    pub apparent_temperature: f64,
    pub humidity: f64,
    pub windspeed: f64,
    pub count: f64,
}

impl HourlyRecord {
    pub const NUM_FEATURES: usize = 11;

    pub const FEATURE_NAMES: [&'static str; Self::NUM_FEATURES] = [
        "season",
        "holiday",
        "workingday",
        "weather",
        "temperature",
        "apparent_temperature",
        "humidity",
        "windspeed",
        "hour",
        "weekday",
        "month",
    ];

    /// Validate a raw row, resolving every categorical field
    pub fn parse(raw: &RawHourlyRecord) -> Result<Self, FeatureError> {
        Ok(Self {
            timestamp: parse_timestamp(&raw.datetime)?,
            season: raw.season.parse()?,
            holiday: parse_flag("holiday", &raw.holiday)?,
            working_day: parse_flag("workingday", &raw.workingday)?,
            weather: raw.weather.parse()?,
            temperature: ensure_finite("temperature", raw.temp)?,
            apparent_temperature: ensure_finite("apparent_temperature", raw.atemp)?,
            humidity: ensure_finite("humidity", raw.humidity)?,
            windspeed: ensure_finite("windspeed", raw.windspeed)?,
            count: ensure_finite("count", raw.count)?,
        })
    }

    /// Feature vector in `FEATURE_NAMES` order
    pub fn encode(&self) -> Result<Vec<f64>, FeatureError> {
        let time = TimeParts::from(self.timestamp);
        let features = vec![
            f64::from(self.season.code()),
            f64::from(u8::from(self.holiday)),
            f64::from(u8::from(self.working_day)),
            f64::from(self.weather.code()),
            ensure_finite("temperature", self.temperature)?,
            ensure_finite("apparent_temperature", self.apparent_temperature)?,
            ensure_finite("humidity", self.humidity)?,
            ensure_finite("windspeed", self.windspeed)?,
            f64::from(time.hour),
            f64::from(time.weekday),
            f64::from(time.month),
        ];
        Ok(features)
    }
}

/// Encode a raw hourly row in one step
pub fn encode_hourly(raw: &RawHourlyRecord) -> Result<Vec<f64>, FeatureError> {
    HourlyRecord::parse(raw)?.encode()
}

// ==================== Rides and dispatch slots ====================

/// One ride row as supplied by the data store or a CSV export
#[derive(Debug, Clone, Deserialize)]
pub struct RawRideRecord {
    #[serde(alias = "start_point")]
    pub region: String,
    #[serde(alias = "ride_datetime")]
    pub timestamp: String,
    pub duration: f64,
    pub distance: f64,
    pub temperature: f64,
    #[serde(alias = "wind_speed")]
    pub windspeed: f64,
    #[serde(alias = "weather")]
    pub weather_type: String,
}

/// A validated ride
#[derive(Debug, Clone, PartialEq)]
pub struct RideRecord {
    pub region: Region,
    pub timestamp: NaiveDateTime,
    /// Minutes
    pub duration: f64,
    /// Kilometres
    pub distance: f64,
    pub temperature: f64,
    /// Metres per second
    pub windspeed: f64,
    pub weather: WeatherType,
}

impl RideRecord {
    pub fn parse(raw: &RawRideRecord) -> Result<Self, FeatureError> {
        Ok(Self {
            region: raw.region.parse()?,
            timestamp: parse_timestamp(&raw.timestamp)?,
            duration: ensure_finite("duration", raw.duration)?,
            distance: ensure_finite("distance", raw.distance)?,
            temperature: ensure_finite("temperature", raw.temperature)?,
            windspeed: ensure_finite("windspeed", raw.windspeed)?,
            weather: raw.weather_type.parse()?,
        })
    }

    /// Slot this ride counts towards, if it falls inside a dispatch period
    pub fn slot_key(&self) -> Option<SlotKey> {
        TimePeriod::from_hour(self.timestamp.hour()).map(|period| SlotKey {
            date: self.timestamp.date(),
            period,
        })
    }
}

/// Position of a dispatch slot on the timeline; orders by date, then period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub period: TimePeriod,
}

impl SlotKey {
    pub fn new(date: NaiveDate, period: TimePeriod) -> Self {
        Self { date, period }
    }

    /// Timestamp at which the slot opens
    pub fn start(&self) -> NaiveDateTime {
        let time = NaiveTime::from_hms_opt(self.period.start_hour(), 0, 0).unwrap_or_default();
        self.date.and_time(time)
    }
}

/// Rides of one region aggregated over one dispatch slot
#[derive(Debug, Clone, PartialEq)]
pub struct DemandSlot {
    pub region: Region,
    pub key: SlotKey,
    pub duration: f64,
    pub distance: f64,
    pub temperature: f64,
    pub windspeed: f64,
    pub weather: WeatherType,
    /// Number of rides started in the slot (the demand target)
    pub rides: u32,
}

impl DemandSlot {
    pub const NUM_FEATURES: usize = 7;

    pub const FEATURE_NAMES: [&'static str; Self::NUM_FEATURES] = [
        "duration",
        "distance",
        "temperature",
        "windspeed",
        "period_code",
        "region_code",
        "weather_code",
    ];

    /// Feature vector in `FEATURE_NAMES` order
    pub fn encode(&self) -> Result<Vec<f64>, FeatureError> {
        encode_slot_features(
            self.duration,
            self.distance,
            self.temperature,
            self.windspeed,
            self.key.period,
            self.region,
            self.weather,
        )
    }

    pub fn target(&self) -> f64 {
        f64::from(self.rides)
    }
}

/// Slot-layout feature vector from its individual parts
pub fn encode_slot_features(
    duration: f64,
    distance: f64,
    temperature: f64,
    windspeed: f64,
    period: TimePeriod,
    region: Region,
    weather: WeatherType,
) -> Result<Vec<f64>, FeatureError> {
    Ok(vec![
        ensure_finite("duration", duration)?,
        ensure_finite("distance", distance)?,
        ensure_finite("temperature", temperature)?,
        ensure_finite("windspeed", windspeed)?,
        f64::from(period.code()),
        f64::from(region.code()),
        f64::from(weather.code()),
    ])
}

/// Outcome of grouping rides into slots
#[derive(Debug, Clone, Default)]
pub struct SlotAggregation {
    /// Slots ordered by region, then chronologically
    pub slots: Vec<DemandSlot>,
    /// Rides outside every dispatch period
    pub skipped: usize,
}

#[derive(Default)]
struct SlotAccumulator {
    rides: u32,
    duration: f64,
    distance: f64,
    temperature: f64,
    windspeed: f64,
    weather_counts: [u32; 3],
}

/// Group rides by `(region, date, period)`
///
/// Continuous fields become slot means; the weather is the most frequent
/// type, ties going to the lower code.
pub fn aggregate_slots(rides: &[RideRecord]) -> SlotAggregation {
    let mut groups: BTreeMap<(Region, SlotKey), SlotAccumulator> = BTreeMap::new();
    let mut skipped = 0;

    for ride in rides {
        let Some(key) = ride.slot_key() else {
            skipped += 1;
            continue;
        };
        let acc = groups.entry((ride.region, key)).or_default();
        acc.rides += 1;
        acc.duration += ride.duration;
        acc.distance += ride.distance;
        acc.temperature += ride.temperature;
        acc.windspeed += ride.windspeed;
        acc.weather_counts[usize::from(ride.weather.code())] += 1;
    }

    let slots = groups
        .into_iter()
        .map(|((region, key), acc)| {
            let n = f64::from(acc.rides);
            let weather = WeatherType::ALL
                .iter()
                .copied()
                .rev()
                .max_by_key(|w| acc.weather_counts[usize::from(w.code())])
                .unwrap_or(WeatherType::Sunny);
            DemandSlot {
                region,
                key,
                duration: acc.duration / n,
                distance: acc.distance / n,
                temperature: acc.temperature / n,
                windspeed: acc.windspeed / n,
                weather,
                rides: acc.rides,
            }
        })
        .collect();

    SlotAggregation { slots, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn raw_hourly() -> RawHourlyRecord {
        RawHourlyRecord {
            datetime: "2011-01-03 08:00:00".to_string(),
            season: "1".to_string(),
            holiday: "0".to_string(),
            workingday: "1".to_string(),
            weather: "2".to_string(),
            temp: 9.84,
            atemp: 14.395,
            humidity: 81.0,
            windspeed: 0.0,
            count: 16.0,
        }
    }

    fn ride(region: Region, ts: &str, weather: WeatherType) -> RideRecord {
        RideRecord {
            region,
            timestamp: parse_timestamp(ts).unwrap(),
            duration: 10.0,
            distance: 2.0,
            temperature: 20.0,
            windspeed: 1.0,
            weather,
        }
    }

    // ==================== Category Closure Tests ====================

    #[test]
    fn test_season_rejects_unknown() {
        let err = "5".parse::<Season>().unwrap_err();
        assert!(matches!(err, FeatureError::UnknownCategory { field: "season", .. }));
    }

    #[test]
    fn test_weather_rejects_unknown() {
        let err = "0".parse::<WeatherSituation>().unwrap_err();
        assert!(matches!(err, FeatureError::UnknownCategory { field: "weather", .. }));
    }

    #[test]
    fn test_time_period_rejects_unknown() {
        let err = "blizzard".parse::<TimePeriod>().unwrap_err();
        assert_eq!(
            err,
            FeatureError::UnknownCategory {
                field: "time_period",
                value: "blizzard".to_string()
            }
        );
    }

    #[test]
    fn test_region_rejects_unknown() {
        let err = "region5".parse::<Region>().unwrap_err();
        assert!(matches!(err, FeatureError::UnknownCategory { field: "region", .. }));
    }

    #[test]
    fn test_weather_type_rejects_unknown() {
        assert!("snowy".parse::<WeatherType>().is_err());
    }

    #[test]
    fn test_categories_parse_canonical_labels() {
        for period in TimePeriod::ALL {
            assert_eq!(period.as_str().parse::<TimePeriod>().unwrap(), *period);
        }
        for region in Region::ALL {
            assert_eq!(region.as_str().parse::<Region>().unwrap(), *region);
        }
        assert_eq!(" Sunny ".parse::<WeatherType>().unwrap(), WeatherType::Sunny);
        assert_eq!("3".parse::<Season>().unwrap(), Season::Fall);
    }

    #[test]
    fn test_category_codes() {
        assert_eq!(TimePeriod::Night.code(), 3);
        assert_eq!(Region::Region1.code(), 0);
        assert_eq!(WeatherType::Cloudy.code(), 2);
        assert_eq!(Season::Winter.code(), 4);
    }

    #[test]
    fn test_categories_serialize_as_labels() {
        assert_eq!(serde_json::to_string(&Region::Region2).unwrap(), "\"region2\"");
        let period: TimePeriod = serde_json::from_str("\"evening\"").unwrap();
        assert_eq!(period, TimePeriod::Evening);
        assert!(serde_json::from_str::<WeatherType>("\"foggy\"").is_err());
    }

    // ==================== Hourly Encoding Tests ====================

    #[test]
    fn test_encode_hourly_field_order() {
        let features = encode_hourly(&raw_hourly()).unwrap();
        assert_eq!(features.len(), HourlyRecord::NUM_FEATURES);
        // 2011-01-03 was a Monday
        assert_eq!(
            features,
            vec![1.0, 0.0, 1.0, 2.0, 9.84, 14.395, 81.0, 0.0, 8.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_encode_hourly_rejects_bad_flag() {
        let mut raw = raw_hourly();
        raw.holiday = "yes".to_string();
        let err = encode_hourly(&raw).unwrap_err();
        assert!(matches!(err, FeatureError::UnknownCategory { field: "holiday", .. }));
    }

    #[test]
    fn test_encode_hourly_rejects_nan() {
        let mut raw = raw_hourly();
        raw.humidity = f64::NAN;
        let err = encode_hourly(&raw).unwrap_err();
        assert!(matches!(err, FeatureError::NonFinite { field: "humidity", .. }));
    }

    #[test]
    fn test_feature_names_count() {
        assert_eq!(FeatureLayout::Hourly.len(), 11);
        assert_eq!(FeatureLayout::Slot.len(), 7);
        assert_eq!(FeatureLayout::from_width(7), Some(FeatureLayout::Slot));
        assert_eq!(FeatureLayout::from_width(11), Some(FeatureLayout::Hourly));
        assert_eq!(FeatureLayout::from_width(8), None);
    }

    #[test]
    fn test_time_parts_sunday_december() {
        let ts = parse_timestamp("2012-12-30T23:00:00").unwrap();
        let parts = TimeParts::from(ts);
        assert_eq!(parts, TimeParts { hour: 23, weekday: 6, month: 12 });
    }

    #[test]
    fn test_parse_timestamp_invalid() {
        assert!(parse_timestamp("yesterday").is_err());
    }

    // ==================== Slot Aggregation Tests ====================

    #[test]
    fn test_period_from_hour() {
        assert_eq!(TimePeriod::from_hour(7), Some(TimePeriod::Morning));
        assert_eq!(TimePeriod::from_hour(8), Some(TimePeriod::Morning));
        assert_eq!(TimePeriod::from_hour(9), None);
        assert_eq!(TimePeriod::from_hour(12), Some(TimePeriod::Noon));
        assert_eq!(TimePeriod::from_hour(22), Some(TimePeriod::Night));
        assert_eq!(TimePeriod::from_hour(3), None);
    }

    #[test]
    fn test_aggregate_slots_means_and_counts() {
        let mut a = ride(Region::Region1, "2024-05-06 07:10:00", WeatherType::Rainy);
        a.duration = 20.0;
        let b = ride(Region::Region1, "2024-05-06 08:50:00", WeatherType::Rainy);
        let c = ride(Region::Region1, "2024-05-06 08:55:00", WeatherType::Sunny);
        let off_hours = ride(Region::Region1, "2024-05-06 15:00:00", WeatherType::Sunny);

        let agg = aggregate_slots(&[a, b, c, off_hours]);

        assert_eq!(agg.skipped, 1);
        assert_eq!(agg.slots.len(), 1);
        let slot = &agg.slots[0];
        assert_eq!(slot.rides, 3);
        assert_eq!(slot.weather, WeatherType::Rainy);
        assert_relative_eq!(slot.duration, 40.0 / 3.0, epsilon = 1e-12);
        assert_eq!(slot.key.period, TimePeriod::Morning);
    }

    #[test]
    fn test_aggregate_slots_weather_tie_prefers_lower_code() {
        let a = ride(Region::Region2, "2024-05-06 11:00:00", WeatherType::Cloudy);
        let b = ride(Region::Region2, "2024-05-06 11:30:00", WeatherType::Sunny);
        let agg = aggregate_slots(&[a, b]);
        assert_eq!(agg.slots[0].weather, WeatherType::Sunny);
    }

    #[test]
    fn test_aggregate_slots_ordering() {
        let rides = vec![
            ride(Region::Region2, "2024-05-06 07:00:00", WeatherType::Sunny),
            ride(Region::Region1, "2024-05-07 07:00:00", WeatherType::Sunny),
            ride(Region::Region1, "2024-05-06 21:30:00", WeatherType::Sunny),
            ride(Region::Region1, "2024-05-06 17:30:00", WeatherType::Sunny),
        ];
        let agg = aggregate_slots(&rides);
        let keys: Vec<(Region, TimePeriod)> =
            agg.slots.iter().map(|s| (s.region, s.key.period)).collect();
        assert_eq!(
            keys,
            vec![
                (Region::Region1, TimePeriod::Evening),
                (Region::Region1, TimePeriod::Night),
                (Region::Region1, TimePeriod::Morning),
                (Region::Region2, TimePeriod::Morning),
            ]
        );
    }

    #[test]
    fn test_slot_encode_order() {
        let slot = DemandSlot {
            region: Region::Region3,
            key: SlotKey::new(NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(), TimePeriod::Evening),
            duration: 15.2,
            distance: 3.5,
            temperature: 25.0,
            windspeed: 2.3,
            weather: WeatherType::Cloudy,
            rides: 12,
        };
        assert_eq!(slot.encode().unwrap(), vec![15.2, 3.5, 25.0, 2.3, 2.0, 2.0, 2.0]);
        assert_eq!(slot.target(), 12.0);
        assert_eq!(slot.key.start().hour(), 17);
    }
}
