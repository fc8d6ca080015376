//! # Event Records and Field Templates
//!
//! An event is a heterogeneous record with fixed slots (status, timestamps,
//! GPS fixes, speeds, sensor arrays, an OBC sub-record, ...). Its wire
//! layout is not fixed: a *field template*, a list of
//! `(field-id, resolution, slot-index, byte-length)` definitions keyed by
//! packet type, declares which slots travel and how wide. Two built-in
//! templates cover the standard- and high-resolution fixed event packets;
//! up to [`MAX_CUSTOM_TEMPLATES`] more can be registered at runtime, and a
//! server that does not know one asks for it by NAK.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::codec::{GpsPoint, PayloadReader, PayloadWriter};
use crate::errors::{CodecError, TemplateError};
use crate::packet::{client_packet, sequence_mask, Packet, PacketType, MAX_PAYLOAD_LEN};

/// Custom templates the registry will hold.
pub const MAX_CUSTOM_TEMPLATES: usize = 5;

// ----------------------------------------------------------------------------
// undefined-value sentinels

pub const UNDEFINED_SPEED: f64 = -1.0;
pub const UNDEFINED_HEADING: f64 = -1.0;
pub const UNDEFINED_ALTITUDE: f64 = -9999.0;
pub const UNDEFINED_DISTANCE: f64 = -1.0;
pub const UNDEFINED_TEMPERATURE: f64 = -9999.0;
pub const UNDEFINED_ACCURACY: f64 = -1.0;
pub const UNDEFINED_MAG_VARIATION: f64 = -9999.0;
pub const UNDEFINED_GEOID_HEIGHT: f64 = -9999.0;
pub const UNDEFINED_DOP: f64 = -1.0;

// ----------------------------------------------------------------------------
// field ids

/// Semantic field identifiers, grouped in blocks of sixteen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldId {
    StatusCode = 0x01,
    Timestamp = 0x02,
    Index = 0x03,
    Sequence = 0x04,

    GpsPoint = 0x06,
    GpsAge = 0x07,
    Speed = 0x08,
    Heading = 0x09,
    Altitude = 0x0A,
    Distance = 0x0B,
    Odometer = 0x0C,

    GeofenceId = 0x0E,
    TopSpeed = 0x0F,

    String = 0x11,
    StringPad = 0x12,
    Entity = 0x15,
    EntityPad = 0x16,
    Binary = 0x1A,

    InputId = 0x21,
    InputState = 0x22,
    OutputId = 0x24,
    OutputState = 0x25,
    ElapsedTime = 0x28,
    Counter = 0x29,

    Sensor32Low = 0x31,
    Sensor32High = 0x32,
    Sensor32Average = 0x33,

    TempLow = 0x3A,
    TempHigh = 0x3B,
    TempAverage = 0x3C,

    GpsDgpsUpdate = 0x41,
    GpsHorzAccuracy = 0x42,
    GpsVertAccuracy = 0x43,
    GpsSatellites = 0x44,
    GpsMagVariation = 0x45,
    GpsQuality = 0x46,
    GpsType = 0x47,
    GpsGeoidHeight = 0x48,
    GpsPdop = 0x49,
    GpsHdop = 0x4A,
    GpsVdop = 0x4B,

    ObcValue = 0x50,
    ObcGeneric = 0x51,
    ObcJ1708Fault = 0x52,
    ObcDistance = 0x54,
    ObcEngineHours = 0x57,
    ObcEngineRpm = 0x58,
    ObcCoolantTemp = 0x59,
    ObcCoolantLevel = 0x5A,
    ObcOilLevel = 0x5B,
    ObcOilPressure = 0x5C,
    ObcFuelLevel = 0x5D,
    ObcFuelEconomy = 0x5E,
    ObcFuelUsed = 0x5F,
}

impl FieldId {
    pub fn from_code(code: u8) -> Option<Self> {
        use FieldId::*;
        Some(match code {
            0x01 => StatusCode,
            0x02 => Timestamp,
            0x03 => Index,
            0x04 => Sequence,
            0x06 => GpsPoint,
            0x07 => GpsAge,
            0x08 => Speed,
            0x09 => Heading,
            0x0A => Altitude,
            0x0B => Distance,
            0x0C => Odometer,
            0x0E => GeofenceId,
            0x0F => TopSpeed,
            0x11 => String,
            0x12 => StringPad,
            0x15 => Entity,
            0x16 => EntityPad,
            0x1A => Binary,
            0x21 => InputId,
            0x22 => InputState,
            0x24 => OutputId,
            0x25 => OutputState,
            0x28 => ElapsedTime,
            0x29 => Counter,
            0x31 => Sensor32Low,
            0x32 => Sensor32High,
            0x33 => Sensor32Average,
            0x3A => TempLow,
            0x3B => TempHigh,
            0x3C => TempAverage,
            0x41 => GpsDgpsUpdate,
            0x42 => GpsHorzAccuracy,
            0x43 => GpsVertAccuracy,
            0x44 => GpsSatellites,
            0x45 => GpsMagVariation,
            0x46 => GpsQuality,
            0x47 => GpsType,
            0x48 => GpsGeoidHeight,
            0x49 => GpsPdop,
            0x4A => GpsHdop,
            0x4B => GpsVdop,
            0x50 => ObcValue,
            0x51 => ObcGeneric,
            0x52 => ObcJ1708Fault,
            0x54 => ObcDistance,
            0x57 => ObcEngineHours,
            0x58 => ObcEngineRpm,
            0x59 => ObcCoolantTemp,
            0x5A => ObcCoolantLevel,
            0x5B => ObcOilLevel,
            0x5C => ObcOilPressure,
            0x5D => ObcFuelLevel,
            0x5E => ObcFuelEconomy,
            0x5F => ObcFuelUsed,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Bitmask tracking which field ids a decode populated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMask([u8; 32]);

impl FieldMask {
    pub fn set(&mut self, field: FieldId) {
        let code = field.code() as usize;
        self.0[code / 8] |= 1 << (code % 8);
    }

    pub fn is_set(&self, field: FieldId) -> bool {
        let code = field.code() as usize;
        self.0[code / 8] & (1 << (code % 8)) != 0
    }
}

// ----------------------------------------------------------------------------
// event record

/// OBC (J1708/J1939) queried value sub-record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObcValue {
    pub mid: u16,
    pub pid: u16,
    pub data: Vec<u8>,
}

/// A telemetry event. Numeric fields default to "undefined" sentinels; the
/// field mask records which slots a decode actually populated.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub status_code: u16,
    pub timestamp: [u32; 2],
    pub index: u32,

    pub gps_point: [GpsPoint; 2],
    pub gps_age: u32,
    pub speed_kph: f64,
    pub heading: f64,
    pub altitude: f64,
    pub distance_km: f64,
    pub odometer_km: f64,

    pub sequence: u32,
    pub seq_len: u8,

    pub geofence_id: [u32; 4],
    pub top_speed_kph: f64,

    pub string: [String; 2],
    pub entity: [String; 2],
    pub binary: Vec<u8>,

    pub input_id: u32,
    pub input_state: u32,
    pub output_id: u32,
    pub output_state: u32,
    pub elapsed_time_sec: [u32; 8],
    pub counter: [u32; 8],

    pub sensor32_lo: [u32; 8],
    pub sensor32_hi: [u32; 8],
    pub sensor32_av: [u32; 8],

    pub temp_lo: [f64; 4],
    pub temp_hi: [f64; 4],
    pub temp_av: [f64; 4],

    pub gps_dgps_update: u32,
    pub gps_horz_accuracy: f64,
    pub gps_vert_accuracy: f64,
    pub gps_satellites: u32,
    pub gps_mag_variation: f64,
    pub gps_quality: u32,
    pub gps_2d3d: u32,
    pub gps_geoid_height: f64,
    pub gps_pdop: f64,
    pub gps_hdop: f64,
    pub gps_vdop: f64,

    pub obc_value: [ObcValue; 2],
    pub obc_generic: [u32; 4],
    pub obc_j1708_fault: [u32; 2],
    pub obc_distance_km: f64,
    pub obc_engine_hours: f64,
    pub obc_engine_rpm: u32,
    pub obc_coolant_temp: f64,
    pub obc_coolant_level: f64,
    pub obc_oil_level: f64,
    pub obc_oil_pressure: f64,
    pub obc_fuel_level: f64,
    pub obc_fuel_economy: f64,
    pub obc_fuel_used: f64,

    pub field_mask: FieldMask,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            status_code: 0,
            timestamp: [0; 2],
            index: 0,
            gps_point: [GpsPoint::default(); 2],
            gps_age: 0,
            speed_kph: UNDEFINED_SPEED,
            heading: UNDEFINED_HEADING,
            altitude: UNDEFINED_ALTITUDE,
            distance_km: UNDEFINED_DISTANCE,
            odometer_km: UNDEFINED_DISTANCE,
            sequence: 0,
            seq_len: 0,
            geofence_id: [0; 4],
            top_speed_kph: UNDEFINED_SPEED,
            string: Default::default(),
            entity: Default::default(),
            binary: Vec::new(),
            input_id: 0,
            input_state: 0,
            output_id: 0,
            output_state: 0,
            elapsed_time_sec: [0; 8],
            counter: [0; 8],
            sensor32_lo: [0; 8],
            sensor32_hi: [0; 8],
            sensor32_av: [0; 8],
            temp_lo: [UNDEFINED_TEMPERATURE; 4],
            temp_hi: [UNDEFINED_TEMPERATURE; 4],
            temp_av: [UNDEFINED_TEMPERATURE; 4],
            gps_dgps_update: 0,
            gps_horz_accuracy: UNDEFINED_ACCURACY,
            gps_vert_accuracy: UNDEFINED_ACCURACY,
            gps_satellites: 0,
            gps_mag_variation: UNDEFINED_MAG_VARIATION,
            gps_quality: 0,
            gps_2d3d: 0,
            gps_geoid_height: UNDEFINED_GEOID_HEIGHT,
            gps_pdop: UNDEFINED_DOP,
            gps_hdop: UNDEFINED_DOP,
            gps_vdop: UNDEFINED_DOP,
            obc_value: Default::default(),
            obc_generic: [0; 4],
            obc_j1708_fault: [0; 2],
            obc_distance_km: UNDEFINED_DISTANCE,
            obc_engine_hours: 0.0,
            obc_engine_rpm: 0,
            obc_coolant_temp: UNDEFINED_TEMPERATURE,
            obc_coolant_level: 0.0,
            obc_oil_level: 0.0,
            obc_oil_pressure: 0.0,
            obc_fuel_level: 0.0,
            obc_fuel_economy: 0.0,
            obc_fuel_used: UNDEFINED_DISTANCE,
            field_mask: FieldMask::default(),
        }
    }
}

impl Event {
    /// A fresh event stamped with the current wall-clock time.
    pub fn now() -> Self {
        let mut ev = Event::default();
        ev.timestamp[0] = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        ev
    }
}

fn clamp_index(ndx: u8, limit: usize) -> usize {
    (ndx as usize).min(limit - 1)
}

// ----------------------------------------------------------------------------
// templates

/// One field of a template: which slot travels, at what resolution, how wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub field: FieldId,
    pub hi_res: bool,
    pub index: u8,
    pub length: u8,
}

impl FieldDef {
    pub const fn new(field: FieldId, hi_res: bool, index: u8, length: u8) -> Self {
        Self {
            field,
            hi_res,
            index,
            length,
        }
    }
}

/// A packet type plus its ordered field definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTemplate {
    pub packet_type: PacketType,
    pub fields: Vec<FieldDef>,
}

impl EventTemplate {
    pub fn new(packet_type: PacketType, fields: Vec<FieldDef>) -> Self {
        Self {
            packet_type,
            fields,
        }
    }

    /// Standard-resolution fixed event layout (packet type 0x30).
    pub fn fixed_standard() -> Self {
        use FieldId::*;
        EventTemplate::new(
            client_packet::FIXED_FMT_STD,
            vec![
                FieldDef::new(StatusCode, false, 0, 2),
                FieldDef::new(Timestamp, false, 0, 4),
                FieldDef::new(GpsPoint, false, 0, 6),
                FieldDef::new(Speed, false, 0, 1),
                FieldDef::new(Heading, false, 0, 1),
                FieldDef::new(Altitude, false, 0, 2),
                FieldDef::new(Distance, false, 0, 3),
                FieldDef::new(Sequence, false, 0, 1),
            ],
        )
    }

    /// High-resolution fixed event layout (packet type 0x31).
    pub fn fixed_high() -> Self {
        use FieldId::*;
        EventTemplate::new(
            client_packet::FIXED_FMT_HIGH,
            vec![
                FieldDef::new(StatusCode, true, 0, 2),
                FieldDef::new(Timestamp, true, 0, 4),
                FieldDef::new(GpsPoint, true, 0, 8),
                FieldDef::new(Speed, true, 0, 2),
                FieldDef::new(Heading, true, 0, 2),
                FieldDef::new(Altitude, true, 0, 3),
                FieldDef::new(Distance, true, 0, 3),
                FieldDef::new(Sequence, true, 0, 1),
            ],
        )
    }

    /// Encode this template as a format-definition packet: the packet type
    /// byte, the field count, then one 24-bit definition per field
    /// (id, hi-res bit + slot index, byte length).
    pub fn to_definition_packet(&self) -> Result<Packet, CodecError> {
        Packet::build(client_packet::FORMAT_DEF, |w| {
            w.write_hex(self.packet_type.type_byte() as u32, 1)?;
            w.write_uint(self.fields.len() as u32, 1)?;
            for fd in &self.fields {
                let def: u32 = ((fd.field.code() as u32) << 16)
                    | ((fd.hi_res as u32) << 15)
                    | (((fd.index & 0x7F) as u32) << 8)
                    | fd.length as u32;
                w.write_hex(def, 3)?;
            }
            Ok(())
        })
    }

    /// Parse and validate a received format-definition payload.
    ///
    /// Rejected definitions: packet type outside the custom event range, a
    /// zero field count, an unknown field id, or a combined length beyond
    /// the maximum payload.
    pub fn from_definition_packet(pkt: &Packet) -> Result<Self, TemplateError> {
        let mut r = pkt.reader();
        let type_byte = r.read_uint(1) as u8;
        let packet_type = PacketType::from_type_byte(type_byte);
        if !packet_type.is_custom_event() {
            return Err(TemplateError::InvalidDefinition);
        }
        let count = r.read_uint(1) as usize;
        if count == 0 || r.remaining() < count * 3 {
            return Err(TemplateError::InvalidDefinition);
        }
        let mut fields = Vec::with_capacity(count);
        let mut total = 0usize;
        for _ in 0..count {
            let def = r.read_uint(3);
            let field = FieldId::from_code(((def >> 16) & 0xFF) as u8)
                .ok_or(TemplateError::InvalidDefinition)?;
            fields.push(FieldDef {
                field,
                hi_res: (def >> 15) & 1 != 0,
                index: ((def >> 8) & 0x7F) as u8,
                length: (def & 0xFF) as u8,
            });
            total += (def & 0xFF) as usize;
        }
        if total > MAX_PAYLOAD_LEN {
            return Err(TemplateError::InvalidDefinition);
        }
        Ok(EventTemplate::new(packet_type, fields))
    }
}

// ----------------------------------------------------------------------------
// registry

/// Template lookup by packet type: the two fixed built-ins plus a bounded
/// table of custom registrations.
#[derive(Debug)]
pub struct TemplateRegistry {
    fixed: [EventTemplate; 2],
    custom: Mutex<Vec<EventTemplate>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            fixed: [EventTemplate::fixed_standard(), EventTemplate::fixed_high()],
            custom: Mutex::new(Vec::new()),
        }
    }

    /// Register a custom template. Collisions (including with the built-ins)
    /// and a full table are config errors, not panics.
    pub fn register(&self, template: EventTemplate) -> Result<(), TemplateError> {
        let ptype = template.packet_type;
        if self.fixed.iter().any(|t| t.packet_type == ptype) {
            return Err(TemplateError::Collision(ptype.0));
        }
        let mut custom = self.custom.lock();
        if custom.iter().any(|t| t.packet_type == ptype) {
            return Err(TemplateError::Collision(ptype.0));
        }
        if custom.len() >= MAX_CUSTOM_TEMPLATES {
            return Err(TemplateError::RegistryFull);
        }
        custom.push(template);
        Ok(())
    }

    pub fn lookup(&self, packet_type: PacketType) -> Option<EventTemplate> {
        self.fixed
            .iter()
            .find(|t| t.packet_type == packet_type)
            .cloned()
            .or_else(|| {
                self.custom
                    .lock()
                    .iter()
                    .find(|t| t.packet_type == packet_type)
                    .cloned()
            })
    }
}

// ----------------------------------------------------------------------------
// event codec

/// Encode an event through a template. The resulting packet inherits the
/// sequence tag when the template carries a sequence field.
pub fn encode_event(event: &Event, template: &EventTemplate) -> Result<Packet, CodecError> {
    let mut seq: Option<(u32, u8)> = None;
    let mut pkt = Packet::build(template.packet_type, |w| {
        for fd in &template.fields {
            encode_field(event, fd, w)?;
            if fd.field == FieldId::Sequence {
                seq = Some((
                    event.sequence & sequence_mask(fd.length),
                    fd.length,
                ));
            }
        }
        Ok(())
    })?;
    if let Some((sequence, seq_len)) = seq {
        pkt.sequence = sequence;
        pkt.seq_len = seq_len;
    }
    Ok(pkt)
}

fn scale_u32(val: f64, hi_res: bool, factor: f64) -> u32 {
    let v = if hi_res { val * factor } else { val };
    if v <= 0.0 {
        0
    } else {
        (v + 0.5) as u32
    }
}

fn scale_i32(val: f64, hi_res: bool, factor: f64) -> i32 {
    let v = if hi_res { val * factor } else { val };
    if v >= 0.0 {
        (v + 0.5) as i32
    } else {
        (v - 0.5) as i32
    }
}

fn percent_u32(val: f64, hi_res: bool) -> u32 {
    let v = if hi_res { val * 1000.0 } else { val * 100.0 };
    if v <= 0.0 {
        0
    } else {
        (v + 0.5) as u32
    }
}

fn encode_field(ev: &Event, fd: &FieldDef, w: &mut PayloadWriter) -> Result<(), CodecError> {
    use FieldId::*;
    let len = fd.length as usize;
    let hi = fd.hi_res;
    match fd.field {
        StatusCode => w.write_hex(ev.status_code as u32, len),
        Timestamp => {
            let ndx = clamp_index(fd.index, ev.timestamp.len());
            w.write_uint(ev.timestamp[ndx], len)
        }
        Index => w.write_uint(ev.index, len),
        Sequence => w.write_hex(ev.sequence & sequence_mask(fd.length), len),
        GpsPoint => {
            let ndx = clamp_index(fd.index, ev.gps_point.len());
            w.write_gps(&ev.gps_point[ndx], len)
        }
        GpsAge => w.write_uint(ev.gps_age, len),
        Speed => w.write_uint(scale_u32(ev.speed_kph, hi, 10.0), len),
        Heading => {
            if hi {
                w.write_uint(scale_u32(ev.heading * 100.0, false, 1.0), len)
            } else {
                let v = if ev.heading <= 0.0 {
                    0.0
                } else {
                    ev.heading * 255.0 / 360.0
                };
                w.write_hex((v + 0.5) as u32, len)
            }
        }
        Altitude => w.write_int(scale_i32(ev.altitude, hi, 10.0), len),
        Distance => w.write_uint(scale_u32(ev.distance_km, hi, 10.0), len),
        Odometer => w.write_uint(scale_u32(ev.odometer_km, hi, 10.0), len),
        GeofenceId => {
            let ndx = clamp_index(fd.index, ev.geofence_id.len());
            w.write_hex(ev.geofence_id[ndx], len)
        }
        TopSpeed => w.write_uint(scale_u32(ev.top_speed_kph, hi, 10.0), len),
        String => {
            let ndx = clamp_index(fd.index, ev.string.len());
            w.write_str(&ev.string[ndx], len)
        }
        StringPad => {
            let ndx = clamp_index(fd.index, ev.string.len());
            w.write_str_padded(&ev.string[ndx], len)
        }
        Entity => {
            let ndx = clamp_index(fd.index, ev.entity.len());
            w.write_str(&ev.entity[ndx], len)
        }
        EntityPad => {
            let ndx = clamp_index(fd.index, ev.entity.len());
            w.write_str_padded(&ev.entity[ndx], len)
        }
        Binary => w.write_bytes(&ev.binary, len),
        InputId => w.write_hex(ev.input_id, len),
        InputState => w.write_hex(ev.input_state, len),
        OutputId => w.write_hex(ev.output_id, len),
        OutputState => w.write_hex(ev.output_state, len),
        ElapsedTime => {
            let ndx = clamp_index(fd.index, ev.elapsed_time_sec.len());
            w.write_uint(ev.elapsed_time_sec[ndx], len)
        }
        Counter => {
            let ndx = clamp_index(fd.index, ev.counter.len());
            w.write_uint(ev.counter[ndx], len)
        }
        Sensor32Low => {
            let ndx = clamp_index(fd.index, ev.sensor32_lo.len());
            w.write_uint(ev.sensor32_lo[ndx], len)
        }
        Sensor32High => {
            let ndx = clamp_index(fd.index, ev.sensor32_hi.len());
            w.write_uint(ev.sensor32_hi[ndx], len)
        }
        Sensor32Average => {
            let ndx = clamp_index(fd.index, ev.sensor32_av.len());
            w.write_uint(ev.sensor32_av[ndx], len)
        }
        TempLow => {
            let ndx = clamp_index(fd.index, ev.temp_lo.len());
            w.write_int(scale_i32(ev.temp_lo[ndx], hi, 10.0), len)
        }
        TempHigh => {
            let ndx = clamp_index(fd.index, ev.temp_hi.len());
            w.write_int(scale_i32(ev.temp_hi[ndx], hi, 10.0), len)
        }
        TempAverage => {
            let ndx = clamp_index(fd.index, ev.temp_av.len());
            w.write_int(scale_i32(ev.temp_av[ndx], hi, 10.0), len)
        }
        GpsDgpsUpdate => w.write_uint(ev.gps_dgps_update, len),
        GpsHorzAccuracy => w.write_uint(scale_u32(ev.gps_horz_accuracy, hi, 10.0), len),
        GpsVertAccuracy => w.write_uint(scale_u32(ev.gps_vert_accuracy, hi, 10.0), len),
        GpsSatellites => w.write_uint(ev.gps_satellites, len),
        GpsMagVariation => w.write_int(scale_i32(ev.gps_mag_variation * 100.0, false, 1.0), len),
        GpsQuality => w.write_uint(ev.gps_quality, len),
        GpsType => w.write_uint(ev.gps_2d3d, len),
        GpsGeoidHeight => w.write_int(scale_i32(ev.gps_geoid_height, hi, 10.0), len),
        GpsPdop => w.write_uint(scale_u32(ev.gps_pdop * 10.0, false, 1.0), len),
        GpsHdop => w.write_uint(scale_u32(ev.gps_hdop * 10.0, false, 1.0), len),
        GpsVdop => w.write_uint(scale_u32(ev.gps_vdop * 10.0, false, 1.0), len),
        ObcValue => {
            let ndx = clamp_index(fd.index, ev.obc_value.len());
            let obc = &ev.obc_value[ndx];
            if len >= 4 {
                w.write_uint(obc.mid as u32, 2)?;
                w.write_uint(obc.pid as u32, 2)?;
                w.write_bytes(&obc.data, len - 4)
            } else {
                w.write_zero(len)
            }
        }
        ObcGeneric => {
            let ndx = clamp_index(fd.index, ev.obc_generic.len());
            w.write_uint(ev.obc_generic[ndx], len)
        }
        ObcJ1708Fault => {
            let ndx = clamp_index(fd.index, ev.obc_j1708_fault.len());
            w.write_hex(ev.obc_j1708_fault[ndx], len)
        }
        ObcDistance => w.write_uint(scale_u32(ev.obc_distance_km, hi, 10.0), len),
        ObcEngineHours => w.write_uint(scale_u32(ev.obc_engine_hours * 10.0, false, 1.0), len),
        ObcEngineRpm => w.write_uint(ev.obc_engine_rpm, len),
        ObcCoolantTemp => w.write_int(scale_i32(ev.obc_coolant_temp, hi, 10.0), len),
        ObcCoolantLevel => w.write_uint(percent_u32(ev.obc_coolant_level, hi), len),
        ObcOilLevel => w.write_uint(percent_u32(ev.obc_oil_level, hi), len),
        ObcOilPressure => w.write_uint(scale_u32(ev.obc_oil_pressure, hi, 10.0), len),
        ObcFuelLevel => w.write_uint(percent_u32(ev.obc_fuel_level, hi), len),
        ObcFuelEconomy => w.write_uint(scale_u32(ev.obc_fuel_economy * 10.0, false, 1.0), len),
        ObcFuelUsed => w.write_uint(scale_u32(ev.obc_fuel_used, hi, 10.0), len),
    }
}

/// Decode an event packet through the registry, marking every populated
/// field in the event's mask. Slots the template does not cover keep their
/// "undefined" sentinels.
pub fn decode_event(pkt: &Packet, registry: &TemplateRegistry) -> Result<Event, TemplateError> {
    let template = registry
        .lookup(pkt.packet_type)
        .ok_or(TemplateError::Unknown(pkt.packet_type.0))?;
    let mut ev = Event::now();
    let mut r = pkt.reader();
    for fd in &template.fields {
        decode_field(&mut ev, fd, &mut r);
        ev.field_mask.set(fd.field);
    }
    Ok(ev)
}

fn unscale(val: u32, hi_res: bool, factor: f64) -> f64 {
    if hi_res {
        val as f64 / factor
    } else {
        val as f64
    }
}

fn unscale_i(val: i32, hi_res: bool, factor: f64) -> f64 {
    if hi_res {
        val as f64 / factor
    } else {
        val as f64
    }
}

fn decode_field(ev: &mut Event, fd: &FieldDef, r: &mut PayloadReader<'_>) {
    use FieldId::*;
    let len = fd.length as usize;
    let hi = fd.hi_res;
    match fd.field {
        StatusCode => ev.status_code = r.read_uint(len) as u16,
        Timestamp => {
            let ndx = clamp_index(fd.index, ev.timestamp.len());
            ev.timestamp[ndx] = r.read_uint(len);
        }
        Index => ev.index = r.read_uint(len),
        Sequence => {
            ev.seq_len = fd.length;
            ev.sequence = r.read_uint(len);
        }
        GpsPoint => {
            let ndx = clamp_index(fd.index, ev.gps_point.len());
            ev.gps_point[ndx] = r.read_gps(len);
        }
        GpsAge => ev.gps_age = r.read_uint(len),
        Speed => ev.speed_kph = unscale(r.read_uint(len), hi, 10.0),
        Heading => {
            ev.heading = if hi {
                r.read_uint(len) as f64 / 100.0
            } else {
                r.read_uint(len) as f64 * 360.0 / 255.0
            };
        }
        Altitude => ev.altitude = unscale_i(r.read_int(len), hi, 10.0),
        Distance => ev.distance_km = unscale(r.read_uint(len), hi, 10.0),
        Odometer => ev.odometer_km = unscale(r.read_uint(len), hi, 10.0),
        GeofenceId => {
            let ndx = clamp_index(fd.index, ev.geofence_id.len());
            ev.geofence_id[ndx] = r.read_uint(len);
        }
        TopSpeed => ev.top_speed_kph = unscale(r.read_uint(len), hi, 10.0),
        String | StringPad => {
            let ndx = clamp_index(fd.index, ev.string.len());
            ev.string[ndx] = r.read_str(len);
        }
        Entity | EntityPad => {
            let ndx = clamp_index(fd.index, ev.entity.len());
            ev.entity[ndx] = r.read_str(len);
        }
        Binary => ev.binary = r.read_bytes(len),
        InputId => ev.input_id = r.read_uint(len),
        InputState => ev.input_state = r.read_uint(len),
        OutputId => ev.output_id = r.read_uint(len),
        OutputState => ev.output_state = r.read_uint(len),
        ElapsedTime => {
            let ndx = clamp_index(fd.index, ev.elapsed_time_sec.len());
            ev.elapsed_time_sec[ndx] = r.read_uint(len);
        }
        Counter => {
            let ndx = clamp_index(fd.index, ev.counter.len());
            ev.counter[ndx] = r.read_uint(len);
        }
        Sensor32Low => {
            let ndx = clamp_index(fd.index, ev.sensor32_lo.len());
            ev.sensor32_lo[ndx] = r.read_uint(len);
        }
        Sensor32High => {
            let ndx = clamp_index(fd.index, ev.sensor32_hi.len());
            ev.sensor32_hi[ndx] = r.read_uint(len);
        }
        Sensor32Average => {
            let ndx = clamp_index(fd.index, ev.sensor32_av.len());
            ev.sensor32_av[ndx] = r.read_uint(len);
        }
        TempLow => {
            let ndx = clamp_index(fd.index, ev.temp_lo.len());
            ev.temp_lo[ndx] = unscale_i(r.read_int(len), hi, 10.0);
        }
        TempHigh => {
            let ndx = clamp_index(fd.index, ev.temp_hi.len());
            ev.temp_hi[ndx] = unscale_i(r.read_int(len), hi, 10.0);
        }
        TempAverage => {
            let ndx = clamp_index(fd.index, ev.temp_av.len());
            ev.temp_av[ndx] = unscale_i(r.read_int(len), hi, 10.0);
        }
        GpsDgpsUpdate => ev.gps_dgps_update = r.read_uint(len),
        GpsHorzAccuracy => ev.gps_horz_accuracy = unscale(r.read_uint(len), hi, 10.0),
        GpsVertAccuracy => ev.gps_vert_accuracy = unscale(r.read_uint(len), hi, 10.0),
        GpsSatellites => ev.gps_satellites = r.read_uint(len),
        GpsMagVariation => ev.gps_mag_variation = r.read_int(len) as f64 / 100.0,
        GpsQuality => ev.gps_quality = r.read_uint(len),
        GpsType => ev.gps_2d3d = r.read_uint(len),
        GpsGeoidHeight => ev.gps_geoid_height = unscale_i(r.read_int(len), hi, 10.0),
        GpsPdop => ev.gps_pdop = r.read_uint(len) as f64 / 10.0,
        GpsHdop => ev.gps_hdop = r.read_uint(len) as f64 / 10.0,
        GpsVdop => ev.gps_vdop = r.read_uint(len) as f64 / 10.0,
        ObcValue => {
            let ndx = clamp_index(fd.index, ev.obc_value.len());
            if len >= 4 {
                let obc = &mut ev.obc_value[ndx];
                obc.mid = r.read_uint(2) as u16;
                obc.pid = r.read_uint(2) as u16;
                obc.data = r.read_bytes(len - 4);
            } else {
                r.skip(len);
            }
        }
        ObcGeneric => {
            let ndx = clamp_index(fd.index, ev.obc_generic.len());
            ev.obc_generic[ndx] = r.read_uint(len);
        }
        ObcJ1708Fault => {
            let ndx = clamp_index(fd.index, ev.obc_j1708_fault.len());
            ev.obc_j1708_fault[ndx] = r.read_uint(len);
        }
        ObcDistance => ev.obc_distance_km = unscale(r.read_uint(len), hi, 10.0),
        ObcEngineHours => ev.obc_engine_hours = r.read_uint(len) as f64 / 10.0,
        ObcEngineRpm => ev.obc_engine_rpm = r.read_uint(len),
        ObcCoolantTemp => ev.obc_coolant_temp = unscale_i(r.read_int(len), hi, 10.0),
        ObcCoolantLevel => {
            let v = r.read_uint(len) as f64;
            ev.obc_coolant_level = if hi { v / 1000.0 } else { v / 100.0 };
        }
        ObcOilLevel => {
            let v = r.read_uint(len) as f64;
            ev.obc_oil_level = if hi { v / 1000.0 } else { v / 100.0 };
        }
        ObcOilPressure => ev.obc_oil_pressure = unscale(r.read_uint(len), hi, 10.0),
        ObcFuelLevel => {
            let v = r.read_uint(len) as f64;
            ev.obc_fuel_level = if hi { v / 1000.0 } else { v / 100.0 };
        }
        ObcFuelEconomy => ev.obc_fuel_economy = r.read_uint(len) as f64 / 10.0,
        ObcFuelUsed => ev.obc_fuel_used = unscale(r.read_uint(len), hi, 10.0),
    }
}

// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let mut ev = Event::default();
        ev.status_code = 0xF020;
        ev.timestamp[0] = 1_200_000_000;
        ev.gps_point[0] = GpsPoint::new(39.1234, -142.5678);
        ev.speed_kph = 45.0;
        ev.heading = 90.0;
        ev.altitude = 1200.0;
        ev.distance_km = 10_000.0;
        ev.sequence = 0x37;
        ev.seq_len = 1;
        ev
    }

    #[test]
    fn test_fixed_standard_round_trip() {
        let registry = TemplateRegistry::new();
        let template = EventTemplate::fixed_standard();
        let pkt = encode_event(&sample_event(), &template).unwrap();
        assert_eq!(pkt.packet_type, client_packet::FIXED_FMT_STD);
        assert_eq!(pkt.sequence, 0x37);
        assert_eq!(pkt.seq_len, 1);

        let ev = decode_event(&pkt, &registry).unwrap();
        assert_eq!(ev.status_code, 0xF020);
        assert_eq!(ev.timestamp[0], 1_200_000_000);
        assert!((ev.gps_point[0].latitude - 39.1234).abs() < 1.25e-5);
        assert!((ev.gps_point[0].longitude + 142.5678).abs() < 1.25e-5);
        assert_eq!(ev.speed_kph, 45.0);
        // low-res heading quantizes to 255 steps
        assert!((ev.heading - 90.0).abs() < 1.0);
        assert_eq!(ev.altitude, 1200.0);
        assert_eq!(ev.distance_km, 10_000.0);
        assert_eq!(ev.sequence, 0x37);
        assert!(ev.field_mask.is_set(FieldId::Speed));
        // slots outside the template keep their sentinels
        assert_eq!(ev.odometer_km, UNDEFINED_DISTANCE);
        assert_eq!(ev.temp_lo[0], UNDEFINED_TEMPERATURE);
        assert!(!ev.field_mask.is_set(FieldId::Odometer));
    }

    #[test]
    fn test_fixed_high_round_trip() {
        let registry = TemplateRegistry::new();
        let template = EventTemplate::fixed_high();
        let mut src = sample_event();
        src.speed_kph = 45.5;
        src.heading = 123.45;
        src.altitude = -12.5;
        let pkt = encode_event(&src, &template).unwrap();
        let ev = decode_event(&pkt, &registry).unwrap();
        assert_eq!(ev.speed_kph, 45.5);
        assert_eq!(ev.heading, 123.45);
        assert_eq!(ev.altitude, -12.5);
    }

    #[test]
    fn test_custom_template_round_trip() {
        use FieldId::*;
        let registry = TemplateRegistry::new();
        let template = EventTemplate::new(
            PacketType(0xE071),
            vec![
                FieldDef::new(StatusCode, false, 0, 2),
                FieldDef::new(TempLow, true, 1, 2),
                FieldDef::new(String, false, 0, 12),
                FieldDef::new(Counter, false, 3, 4),
                FieldDef::new(Sequence, false, 0, 2),
            ],
        );
        registry.register(template.clone()).unwrap();

        let mut src = Event::default();
        src.status_code = 0xE123;
        src.temp_lo[1] = -12.5;
        src.string[0] = "trailer-7".to_string();
        src.counter[3] = 98765;
        src.sequence = 0x0102;

        let pkt = encode_event(&src, &template).unwrap();
        let ev = decode_event(&pkt, &registry).unwrap();
        assert_eq!(ev.status_code, 0xE123);
        assert_eq!(ev.temp_lo[1], -12.5);
        assert_eq!(ev.string[0], "trailer-7");
        assert_eq!(ev.counter[3], 98765);
        assert_eq!(ev.sequence, 0x0102);
        assert_eq!(ev.seq_len, 2);
    }

    #[test]
    fn test_slot_index_clamped() {
        use FieldId::*;
        let registry = TemplateRegistry::new();
        let template = EventTemplate::new(
            PacketType(0xE072),
            vec![FieldDef::new(Timestamp, false, 9, 4)],
        );
        registry.register(template.clone()).unwrap();
        let mut src = Event::default();
        src.timestamp[1] = 42;
        let pkt = encode_event(&src, &template).unwrap();
        let ev = decode_event(&pkt, &registry).unwrap();
        // index 9 lands in the last valid slot
        assert_eq!(ev.timestamp[1], 42);
    }

    #[test]
    fn test_registry_limits() {
        let registry = TemplateRegistry::new();
        assert_eq!(
            registry.register(EventTemplate::fixed_standard()),
            Err(TemplateError::Collision(0xE030))
        );
        for i in 0..MAX_CUSTOM_TEMPLATES {
            let t = EventTemplate::new(
                PacketType(0xE070 + i as u16),
                vec![FieldDef::new(FieldId::StatusCode, false, 0, 2)],
            );
            registry.register(t).unwrap();
        }
        let overflow = EventTemplate::new(
            PacketType(0xE07A),
            vec![FieldDef::new(FieldId::StatusCode, false, 0, 2)],
        );
        assert_eq!(registry.register(overflow), Err(TemplateError::RegistryFull));
    }

    #[test]
    fn test_decode_unknown_type() {
        let registry = TemplateRegistry::new();
        let pkt = Packet::empty(PacketType(0xE07E));
        assert_eq!(
            decode_event(&pkt, &registry),
            Err(TemplateError::Unknown(0xE07E))
        );
    }

    #[test]
    fn test_definition_packet_round_trip() {
        let template = EventTemplate::new(
            PacketType(0xE073),
            vec![
                FieldDef::new(FieldId::StatusCode, false, 0, 2),
                FieldDef::new(FieldId::GpsPoint, true, 1, 8),
                FieldDef::new(FieldId::Sequence, false, 0, 1),
            ],
        );
        let pkt = template.to_definition_packet().unwrap();
        assert_eq!(pkt.packet_type, client_packet::FORMAT_DEF);
        let parsed = EventTemplate::from_definition_packet(&pkt).unwrap();
        assert_eq!(parsed, template);
    }

    #[test]
    fn test_definition_validation() {
        // fixed range is not registrable
        let bad = EventTemplate::new(
            PacketType(0xE030),
            vec![FieldDef::new(FieldId::StatusCode, false, 0, 2)],
        );
        let pkt = bad.to_definition_packet().unwrap();
        assert_eq!(
            EventTemplate::from_definition_packet(&pkt),
            Err(TemplateError::InvalidDefinition)
        );

        // oversized combined length
        let big = EventTemplate::new(
            PacketType(0xE074),
            vec![
                FieldDef::new(FieldId::Binary, false, 0, 200),
                FieldDef::new(FieldId::Binary, false, 0, 200),
            ],
        );
        let pkt = big.to_definition_packet().unwrap();
        assert_eq!(
            EventTemplate::from_definition_packet(&pkt),
            Err(TemplateError::InvalidDefinition)
        );
    }
}
