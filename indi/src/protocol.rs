//! INDI XML Protocol definitions and outgoing message builders

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Standard INDI properties used by the session devices
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_TEMPERATURE_VALUE: &str = "CCD_TEMPERATURE_VALUE";
    pub const CCD_GAIN: &str = "CCD_GAIN";
    pub const GAIN: &str = "GAIN";
    pub const CCD_OFFSET: &str = "CCD_OFFSET";
    pub const OFFSET: &str = "OFFSET";
    pub const CCD1: &str = "CCD1"; // BLOB property for image data

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const RA: &str = "RA";
    pub const DEC: &str = "DEC";
    pub const HORIZONTAL_COORD: &str = "HORIZONTAL_COORD";
    pub const ALT: &str = "ALT";
    pub const AZ: &str = "AZ";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TRACK: &str = "TRACK";
    pub const SYNC: &str = "SYNC";
    pub const TELESCOPE_TRACK_STATE: &str = "TELESCOPE_TRACK_STATE";
    pub const TRACK_ON: &str = "TRACK_ON";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
    pub const PARK: &str = "PARK";
    pub const UNPARK: &str = "UNPARK";
    pub const TELESCOPE_PIER_SIDE: &str = "TELESCOPE_PIER_SIDE";
    pub const PIER_EAST: &str = "PIER_EAST";
    pub const PIER_WEST: &str = "PIER_WEST";
    pub const TIME_LST: &str = "TIME_LST";
    pub const LST: &str = "LST";
    pub const GEOGRAPHIC_COORD: &str = "GEOGRAPHIC_COORD";
    pub const LAT: &str = "LAT";
    pub const LONG: &str = "LONG";
    pub const ELEV: &str = "ELEV";

    /// Per-axis drive status lights published by SkyWatcher/EQMod style drivers
    pub const RASTATUS: &str = "RASTATUS";
    pub const DESTATUS: &str = "DESTATUS";

    // Focuser properties
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const FOCUS_ABSOLUTE_POSITION: &str = "FOCUS_ABSOLUTE_POSITION";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_SLOT_VALUE: &str = "FILTER_SLOT_VALUE";
    pub const FILTER_NAME: &str = "FILTER_NAME";
}

/// Escape a value for inclusion in INDI XML text or attributes
pub fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn get_properties_message() -> String {
    format!("<getProperties version=\"{}\"/>", INDI_PROTOCOL_VERSION)
}

pub fn enable_blob_message(device: &str) -> String {
    format!(
        "<enableBLOB device=\"{}\">Also</enableBLOB>",
        escape_xml(device)
    )
}

pub fn new_switch_vector(device: &str, property: &str, element: &str, state: bool) -> String {
    let state_str = if state { "On" } else { "Off" };
    format!(
        "<newSwitchVector device=\"{}\" name=\"{}\">\
         <oneSwitch name=\"{}\">{}</oneSwitch>\
         </newSwitchVector>",
        escape_xml(device),
        escape_xml(property),
        escape_xml(element),
        state_str
    )
}

pub fn new_number_vector(device: &str, property: &str, values: &[(&str, f64)]) -> String {
    let elements: String = values
        .iter()
        .map(|(name, value)| {
            format!(
                "<oneNumber name=\"{}\">{}</oneNumber>",
                escape_xml(name),
                value
            )
        })
        .collect();
    format!(
        "<newNumberVector device=\"{}\" name=\"{}\">{}</newNumberVector>",
        escape_xml(device),
        escape_xml(property),
        elements
    )
}
