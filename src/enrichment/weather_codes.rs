//! WMO weather-code interpretation.
//!
//! Maps the numeric WMO codes returned by the weather archive to the
//! short descriptions stored on pricing rows, plus a coarse severity
//! scale used by downstream analytics (0 best … 4 worst).

/// Human-readable description for a WMO weather code.
pub fn describe(code: i32) -> &'static str {
    match code {
        0 => "Clear",
        1 | 2 | 3 => "Partly Cloudy",
        45 | 48 => "Foggy",
        51 | 53 | 55 | 56 | 57 => "Drizzle",
        61 | 63 | 65 | 66 | 67 | 80 | 81 | 82 => "Rainy",
        71 | 73 | 75 | 77 | 85 | 86 => "Snowy",
        95 | 96 | 99 => "Thunderstorm",
        _ => "Cloudy",
    }
}

/// Severity on a 0…4 scale: 0 = Clear, 4 = Thunderstorm/Snowy.
pub fn severity(code: i32) -> u8 {
    match describe(code) {
        "Clear" => 0,
        "Partly Cloudy" | "Cloudy" => 1,
        "Drizzle" => 2,
        "Foggy" | "Rainy" => 3,
        "Thunderstorm" | "Snowy" => 4,
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
