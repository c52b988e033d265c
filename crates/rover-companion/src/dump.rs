//! Binary dump files.
//!
//! Two formats share one primitive codec: signed integers as zig-zagged
//! varints, IEEE-754 little-endian floats and doubles, and UTF-8 strings
//! with a 4-byte little-endian length prefix.
//!
//! - The I/O journal records every line crossing the link with a
//!   direction marker (`<` RX, `>` TX) and a host-clock timestamp.
//! - The world-model file starts with a header (robot spec, sector
//!   count, grid size, topology) followed by
//!   `(status, radar, markers, commands)` records.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use thiserror::Error;

use rover_core::clock::ClockSync;
use rover_core::geometry::{Angle, Point};
use rover_core::grid::GridTopology;
use rover_core::marker::{LabelMarker, MarkerMap};
use rover_core::msg::{MoveCommand, RobotCommands, SensorMessage};
use rover_core::radar::{MapCell, RadarMap};
use rover_core::status::{RobotSpec, RobotStatus};

/// Direction marker for a received line.
pub const MARKER_RX: u8 = b'<';
/// Direction marker for a transmitted line.
pub const MARKER_TX: u8 = b'>';

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("varint longer than 10 bytes")]
    VarintOverflow,
    #[error("string is not valid UTF-8")]
    BadString,
    #[error("unknown direction marker 0x{0:02x}")]
    BadMarker(u8),
}

// ─── Primitive codec ─────────────────────────────────────────────────

/// Writes the primitive kinds to any byte sink.
pub struct DataWriter<W: Write> {
    inner: W,
}

impl<W: Write> DataWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn flush(&mut self) -> Result<(), DumpError> {
        self.inner.flush()?;
        Ok(())
    }

    /// Zig-zagged varint.
    pub fn write_long(&mut self, value: i64) -> Result<(), DumpError> {
        let mut z = ((value << 1) ^ (value >> 63)) as u64;
        loop {
            let byte = (z & 0x7f) as u8;
            z >>= 7;
            if z == 0 {
                self.inner.write_all(&[byte])?;
                return Ok(());
            }
            self.inner.write_all(&[byte | 0x80])?;
        }
    }

    pub fn write_float(&mut self, value: f32) -> Result<(), DumpError> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    pub fn write_double(&mut self, value: f64) -> Result<(), DumpError> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// 4-byte length-prefixed UTF-8.
    pub fn write_string(&mut self, value: &str) -> Result<(), DumpError> {
        let bytes = value.as_bytes();
        self.inner.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.inner.write_all(bytes)?;
        Ok(())
    }
}

/// Reads the primitive kinds back.
pub struct DataReader<R: Read> {
    inner: R,
}

impl<R: Read> DataReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_byte(&mut self) -> Result<u8, DumpError> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// `None` on a clean end of stream, the byte otherwise.
    fn read_byte_or_eof(&mut self) -> Result<Option<u8>, DumpError> {
        let mut buf = [0u8; 1];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf[0])),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_long(&mut self) -> Result<i64, DumpError> {
        let mut z: u64 = 0;
        for shift in (0..70).step_by(7) {
            if shift > 63 {
                return Err(DumpError::VarintOverflow);
            }
            let byte = self.read_byte()?;
            z |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                let value = ((z >> 1) as i64) ^ -((z & 1) as i64);
                return Ok(value);
            }
        }
        Err(DumpError::VarintOverflow)
    }

    pub fn read_float(&mut self) -> Result<f32, DumpError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    pub fn read_double(&mut self) -> Result<f64, DumpError> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    pub fn read_string(&mut self) -> Result<String, DumpError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        let len = u32::from_le_bytes(buf) as usize;
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| DumpError::BadString)
    }
}

// ─── I/O journal ─────────────────────────────────────────────────────

/// One journal entry: direction, host-clock timestamp, raw line. On
/// read, received lines that decode cleanly come back as messages.
#[derive(Clone, Debug, PartialEq)]
pub enum DumpRecord {
    RxMessage {
        timestamp: i64,
        message: SensorMessage,
        line: String,
    },
    RxUnparsed {
        timestamp: i64,
        line: String,
    },
    Tx {
        timestamp: i64,
        line: String,
    },
}

impl DumpRecord {
    pub fn timestamp(&self) -> i64 {
        match self {
            DumpRecord::RxMessage { timestamp, .. } => *timestamp,
            DumpRecord::RxUnparsed { timestamp, .. } => *timestamp,
            DumpRecord::Tx { timestamp, .. } => *timestamp,
        }
    }

    pub fn line(&self) -> &str {
        match self {
            DumpRecord::RxMessage { line, .. } => line,
            DumpRecord::RxUnparsed { line, .. } => line,
            DumpRecord::Tx { line, .. } => line,
        }
    }
}

/// Appends journal records to a file.
pub struct DumpWriter {
    data: DataWriter<BufWriter<File>>,
}

impl DumpWriter {
    pub fn create(path: &Path) -> Result<Self, DumpError> {
        let file = File::create(path)?;
        Ok(Self {
            data: DataWriter::new(BufWriter::new(file)),
        })
    }

    pub fn rx(&mut self, timestamp: i64, line: &str) -> Result<(), DumpError> {
        self.record(MARKER_RX, timestamp, line)
    }

    pub fn tx(&mut self, timestamp: i64, line: &str) -> Result<(), DumpError> {
        self.record(MARKER_TX, timestamp, line)
    }

    fn record(&mut self, marker: u8, timestamp: i64, line: &str) -> Result<(), DumpError> {
        self.data.inner.write_all(&[marker])?;
        self.data.write_long(timestamp)?;
        self.data.write_string(line)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), DumpError> {
        self.data.flush()
    }
}

/// Reads journal records back in order.
pub struct DumpReader {
    data: DataReader<BufReader<File>>,
}

impl DumpReader {
    pub fn open(path: &Path) -> Result<Self, DumpError> {
        let file = File::open(path)?;
        Ok(Self {
            data: DataReader::new(BufReader::new(file)),
        })
    }

    /// The next record, or `None` at the end of the journal.
    pub fn next_record(&mut self) -> Result<Option<DumpRecord>, DumpError> {
        let Some(marker) = self.data.read_byte_or_eof()? else {
            return Ok(None);
        };
        let timestamp = self.data.read_long()?;
        let line = self.data.read_string()?;
        let record = match marker {
            MARKER_TX => DumpRecord::Tx { timestamp, line },
            MARKER_RX => match SensorMessage::decode(&line) {
                Ok(message) => DumpRecord::RxMessage {
                    timestamp,
                    message,
                    line,
                },
                Err(_) => DumpRecord::RxUnparsed { timestamp, line },
            },
            other => return Err(DumpError::BadMarker(other)),
        };
        Ok(Some(record))
    }
}

// ─── World-model file ────────────────────────────────────────────────

/// Header of a world-model file.
#[derive(Clone, Debug, PartialEq)]
pub struct WorldFileHeader {
    pub spec: RobotSpec,
    pub num_sectors: usize,
    /// Grid cell size in metres.
    pub grid_size: f64,
    pub topology: GridTopology,
}

/// One persisted snapshot.
#[derive(Clone, Debug)]
pub struct WorldFileRecord {
    pub status: RobotStatus,
    pub radar: RadarMap,
    pub markers: MarkerMap,
    pub commands: RobotCommands,
}

/// Writes the world-model stream: header once, then records.
pub struct WorldModelWriter {
    data: DataWriter<BufWriter<File>>,
}

impl WorldModelWriter {
    pub fn create(
        path: &Path,
        spec: &RobotSpec,
        num_sectors: usize,
        topology: &GridTopology,
    ) -> Result<Self, DumpError> {
        let file = File::create(path)?;
        let mut writer = Self {
            data: DataWriter::new(BufWriter::new(file)),
        };
        writer.write_spec(spec)?;
        writer.data.write_long(num_sectors as i64)?;
        writer.data.write_double(topology.cell_size())?;
        writer.write_topology(topology)?;
        Ok(writer)
    }

    fn write_spec(&mut self, spec: &RobotSpec) -> Result<(), DumpError> {
        self.data.write_double(spec.max_radar_distance)?;
        // Angles as their unit components so the roundtrip is exact.
        self.data.write_double(spec.receptive_angle.sin())?;
        self.data.write_double(spec.receptive_angle.cos())?;
        self.data.write_double(spec.contact_radius)?;
        self.data.write_double(spec.camera_half_view.sin())?;
        self.data.write_double(spec.camera_half_view.cos())?;
        self.data.write_double(spec.marker_size)?;
        self.data.write_double(spec.camera_angular_ratio)?;
        self.data.write_double(spec.safe_distance)?;
        self.data.write_double(spec.supply_scale)?;
        Ok(())
    }

    fn write_topology(&mut self, topology: &GridTopology) -> Result<(), DumpError> {
        self.data.write_double(topology.centre().x)?;
        self.data.write_double(topology.centre().y)?;
        self.data.write_long(topology.width() as i64)?;
        self.data.write_long(topology.height() as i64)?;
        self.data.write_double(topology.cell_size())?;
        Ok(())
    }

    pub fn append(
        &mut self,
        status: &RobotStatus,
        radar: &RadarMap,
        markers: &MarkerMap,
        commands: &RobotCommands,
    ) -> Result<(), DumpError> {
        self.write_status(status)?;
        self.write_radar(radar)?;
        self.write_markers(markers)?;
        self.write_commands(commands)?;
        Ok(())
    }

    fn write_status(&mut self, status: &RobotStatus) -> Result<(), DumpError> {
        let clock = status.clock();
        self.data.write_long(clock.offset())?;
        self.data.write_long(clock.latency())?;
        self.data.write_long(clock.receive_timestamp())?;
        // One canonical line per channel, empty when no sample arrived.
        for line in [
            status
                .motion()
                .map(|m| SensorMessage::Motion(m.clone()).encode()),
            status
                .proxy()
                .map(|m| SensorMessage::Proxy(m.clone()).encode()),
            status
                .contacts()
                .map(|m| SensorMessage::Contacts(*m).encode()),
            status
                .supply()
                .map(|m| SensorMessage::Supply(*m).encode()),
            status
                .camera()
                .map(|m| SensorMessage::Camera(m.clone()).encode()),
        ] {
            self.data.write_string(line.as_deref().unwrap_or(""))?;
        }
        Ok(())
    }

    fn write_radar(&mut self, radar: &RadarMap) -> Result<(), DumpError> {
        self.data.write_long(radar.clean_timestamp())?;
        for cell in radar.cells() {
            self.data.write_long(cell.echo_time)?;
            self.data.write_double(cell.echo_weight)?;
            self.data.write_long(cell.contact_time)?;
            self.data.write_long(cell.label_time)?;
            self.data.write_double(cell.label_weight)?;
        }
        Ok(())
    }

    fn write_markers(&mut self, markers: &MarkerMap) -> Result<(), DumpError> {
        self.data.write_long(markers.len() as i64)?;
        // Stable order keeps files comparable.
        let mut labels: Vec<&String> = markers.keys().collect();
        labels.sort();
        for label in labels {
            let marker = &markers[label];
            self.data.write_string(&marker.label)?;
            self.data.write_double(marker.location.x)?;
            self.data.write_double(marker.location.y)?;
            self.data.write_double(marker.weight)?;
            self.data.write_long(marker.marker_time)?;
            self.data.write_long(marker.clean_time)?;
        }
        Ok(())
    }

    fn write_commands(&mut self, commands: &RobotCommands) -> Result<(), DumpError> {
        self.data.write_long(commands.halt as i64)?;
        match &commands.move_to {
            Some(mv) => {
                self.data.write_long(1)?;
                self.data.write_long(mv.direction_deg as i64)?;
                self.data.write_double(mv.speed)?;
            }
            None => self.data.write_long(0)?,
        }
        match commands.scan {
            Some(dir) => {
                self.data.write_long(1)?;
                self.data.write_long(dir as i64)?;
            }
            None => self.data.write_long(0)?,
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), DumpError> {
        self.data.flush()
    }
}

/// Reads a world-model file back.
pub struct WorldModelReader {
    data: DataReader<BufReader<File>>,
    header: WorldFileHeader,
}

impl WorldModelReader {
    pub fn open(path: &Path) -> Result<Self, DumpError> {
        let file = File::open(path)?;
        let mut data = DataReader::new(BufReader::new(file));
        let spec = read_spec(&mut data)?;
        let num_sectors = data.read_long()? as usize;
        let grid_size = data.read_double()?;
        let topology = read_topology(&mut data)?;
        Ok(Self {
            data,
            header: WorldFileHeader {
                spec,
                num_sectors,
                grid_size,
                topology,
            },
        })
    }

    pub fn header(&self) -> &WorldFileHeader {
        &self.header
    }

    /// The next snapshot, or `None` at the end of the file.
    pub fn next_record(&mut self) -> Result<Option<WorldFileRecord>, DumpError> {
        let Some(first) = self.data.read_byte_or_eof()? else {
            return Ok(None);
        };
        let offset = self.resume_long(first)?;
        let latency = self.data.read_long()?;
        let receive = self.data.read_long()?;
        let mut status = RobotStatus::new(self.header.spec.clone())
            .with_clock(ClockSync::from_parts(offset, latency, receive));
        for _ in 0..5 {
            let line = self.data.read_string()?;
            if line.is_empty() {
                continue;
            }
            if let Ok(message) = SensorMessage::decode(&line) {
                status = match message {
                    SensorMessage::Motion(m) => status.with_motion(m),
                    SensorMessage::Proxy(m) => status.with_proxy(m),
                    SensorMessage::Contacts(m) => status.with_contacts(m),
                    SensorMessage::Supply(m) => status.with_supply(m),
                    SensorMessage::Camera(m) => status.with_camera(m),
                };
            }
        }

        let clean_timestamp = self.data.read_long()?;
        let topology = self.header.topology;
        let mut cells = Vec::with_capacity(topology.n());
        for i in 0..topology.n() {
            let mut cell = MapCell::unknown(topology.location_of(i));
            cell.echo_time = self.data.read_long()?;
            cell.echo_weight = self.data.read_double()?;
            cell.contact_time = self.data.read_long()?;
            cell.label_time = self.data.read_long()?;
            cell.label_weight = self.data.read_double()?;
            cells.push(cell);
        }
        let radar = RadarMap::from_cells(topology, cells, clean_timestamp);

        let mut markers = MarkerMap::new();
        let count = self.data.read_long()?;
        for _ in 0..count {
            let label = self.data.read_string()?;
            let x = self.data.read_double()?;
            let y = self.data.read_double()?;
            let weight = self.data.read_double()?;
            let marker_time = self.data.read_long()?;
            let clean_time = self.data.read_long()?;
            markers.insert(
                label.clone(),
                LabelMarker {
                    label,
                    location: Point::new(x, y),
                    weight,
                    marker_time,
                    clean_time,
                },
            );
        }

        let halt = self.data.read_long()? != 0;
        let move_to = if self.data.read_long()? != 0 {
            let direction_deg = self.data.read_long()? as i32;
            let speed = self.data.read_double()?;
            Some(MoveCommand {
                direction_deg,
                speed,
            })
        } else {
            None
        };
        let scan = if self.data.read_long()? != 0 {
            Some(self.data.read_long()? as i32)
        } else {
            None
        };

        Ok(Some(WorldFileRecord {
            status,
            radar,
            markers,
            commands: RobotCommands {
                move_to,
                scan,
                halt,
            },
        }))
    }

    /// Finish reading a varint whose first byte was already consumed by
    /// the end-of-file probe.
    fn resume_long(&mut self, first: u8) -> Result<i64, DumpError> {
        let mut z: u64 = (first & 0x7f) as u64;
        if first & 0x80 != 0 {
            let mut shift = 7;
            loop {
                if shift > 63 {
                    return Err(DumpError::VarintOverflow);
                }
                let byte = self.data.read_byte()?;
                z |= ((byte & 0x7f) as u64) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
        }
        Ok(((z >> 1) as i64) ^ -((z & 1) as i64))
    }
}

fn read_spec<R: Read>(data: &mut DataReader<R>) -> Result<RobotSpec, DumpError> {
    let max_radar_distance = data.read_double()?;
    let receptive_sin = data.read_double()?;
    let receptive_cos = data.read_double()?;
    let contact_radius = data.read_double()?;
    let view_sin = data.read_double()?;
    let view_cos = data.read_double()?;
    Ok(RobotSpec {
        max_radar_distance,
        receptive_angle: Angle::from_components(receptive_sin, receptive_cos),
        contact_radius,
        camera_half_view: Angle::from_components(view_sin, view_cos),
        marker_size: data.read_double()?,
        camera_angular_ratio: data.read_double()?,
        safe_distance: data.read_double()?,
        supply_scale: data.read_double()?,
    })
}

fn read_topology<R: Read>(data: &mut DataReader<R>) -> Result<GridTopology, DumpError> {
    let cx = data.read_double()?;
    let cy = data.read_double()?;
    let width = data.read_long()? as usize;
    let height = data.read_long()? as usize;
    let cell_size = data.read_double()?;
    Ok(GridTopology::new(Point::new(cx, cy), width, height, cell_size))
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("rover-dump-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_long_roundtrip() {
        let mut writer = DataWriter::new(Vec::new());
        let values = [
            0i64,
            1,
            -1,
            63,
            64,
            -64,
            -65,
            300,
            -300,
            i64::MAX,
            i64::MIN,
        ];
        for v in values {
            writer.write_long(v).unwrap();
        }
        let bytes = writer.into_inner();
        let mut reader = DataReader::new(Cursor::new(bytes));
        for v in values {
            assert_eq!(reader.read_long().unwrap(), v);
        }
    }

    #[test]
    fn test_zigzag_small_values_stay_one_byte() {
        for v in [0i64, -1, 1, -63, 63] {
            let mut writer = DataWriter::new(Vec::new());
            writer.write_long(v).unwrap();
            assert_eq!(writer.into_inner().len(), 1, "value {v}");
        }
    }

    #[test]
    fn test_float_double_string_roundtrip() {
        let mut writer = DataWriter::new(Vec::new());
        writer.write_float(1.5).unwrap();
        writer.write_double(-0.125).unwrap();
        writer.write_string("hello rover").unwrap();
        writer.write_string("").unwrap();
        let bytes = writer.into_inner();

        let mut reader = DataReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_float().unwrap(), 1.5);
        assert_eq!(reader.read_double().unwrap(), -0.125);
        assert_eq!(reader.read_string().unwrap(), "hello rover");
        assert_eq!(reader.read_string().unwrap(), "");
    }

    #[test]
    fn test_journal_roundtrip() {
        let path = temp_path("journal");
        {
            let mut writer = DumpWriter::create(&path).unwrap();
            writer.rx(1000, "px 2000 30 5882 0 0 60").unwrap();
            writer.rx(1001, "garbage line").unwrap();
            writer.tx(1002, "mv 45 20").unwrap();
            writer.flush().unwrap();
        }

        let mut reader = DumpReader::open(&path).unwrap();
        let first = reader.next_record().unwrap().unwrap();
        assert!(matches!(first, DumpRecord::RxMessage { timestamp: 1000, .. }));
        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(
            second,
            DumpRecord::RxUnparsed {
                timestamp: 1001,
                line: "garbage line".to_string()
            }
        );
        let third = reader.next_record().unwrap().unwrap();
        assert_eq!(third.line(), "mv 45 20");
        assert!(reader.next_record().unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_world_file_roundtrip() {
        use rover_core::radar::{RadarModeller, RadarParams, SensorSignal};
        use rover_core::geometry::DEG0;

        let path = temp_path("world");
        let spec = RobotSpec::default();
        let topology = GridTopology::new(Point::new(0.0, 0.0), 11, 11, 0.2);
        let radar = RadarModeller::new(RadarParams::default()).apply_signal(
            &RadarMap::new(topology),
            &SensorSignal {
                location: Point::new(0.0, 0.0),
                direction: DEG0,
                distance: 0.6,
                timestamp: 1000,
                echo: true,
            },
        );
        let status = RobotStatus::new(spec.clone())
            .with_clock(ClockSync::estimate(100, 500, 600, 220));
        let mut markers = MarkerMap::new();
        markers.insert(
            "A".to_string(),
            LabelMarker {
                label: "A".to_string(),
                location: Point::new(1.0, 0.5),
                weight: 1.0,
                marker_time: 900,
                clean_time: 900,
            },
        );
        let commands = RobotCommands {
            move_to: Some(MoveCommand {
                direction_deg: 45,
                speed: 20.0,
            }),
            scan: None,
            halt: false,
        };

        {
            let mut writer = WorldModelWriter::create(&path, &spec, 24, &topology).unwrap();
            writer.append(&status, &radar, &markers, &commands).unwrap();
            writer.flush().unwrap();
        }

        let mut reader = WorldModelReader::open(&path).unwrap();
        assert_eq!(reader.header().num_sectors, 24);
        assert_eq!(reader.header().spec, spec);
        assert_eq!(reader.header().topology, topology);

        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.radar.cells(), radar.cells());
        assert_eq!(record.radar.clean_timestamp(), radar.clean_timestamp());
        assert_eq!(record.markers, markers);
        assert_eq!(record.commands, commands);
        assert_eq!(record.status.reset_time(), 500);
        assert!(reader.next_record().unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }
}
