use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Larger length prefixes are treated as corruption.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Fill `buf` or report a clean/torn end of file as `Ok(false)`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next record's payload, or `None` at end of log, a torn tail, or a CRC mismatch.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only write-ahead log of committed [`Event`]s.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn or corrupt tail is dropped on replay; everything before it survives.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful fsync.
    synced_len: u64,
    appends_since_compact: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            appends_since_compact: 0,
        })
    }

    /// Replay the log and cut off any torn or corrupt tail, so later appends
    /// land directly after the last intact record.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, good_len) = Self::scan(path)?;
        match fs::metadata(path) {
            Ok(meta) if meta.len() > good_len => {
                warn!(
                    "truncating WAL {} from {} to {good_len} bytes",
                    path.display(),
                    meta.len()
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(good_len)?;
                file.sync_all()?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(events)
    }

    /// Append and fsync one event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Drop everything written or buffered since the last successful
    /// `flush_sync`, leaving no partial record behind.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unwritten buffer instead of flushing it.
        let (_, _unwritten) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = open_append(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event on disk, in append order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Intact events plus the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut good_len = 0u64;

        while let Some(payload) = read_record(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    events.push(event);
                    good_len += 8 + payload.len() as u64;
                }
                Err(e) => {
                    warn!("WAL replay stopped at record {}: {e}", events.len());
                    break;
                }
            }
        }

        Ok((events, good_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::time::TimeOfDay;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rigtime_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn slot(id: Ulid) -> Slot {
        Slot {
            id,
            platform: Platform::Console,
            title: Some("Bay 1".into()),
            start_time: TimeOfDay::new(17, 0).unwrap(),
            end_time: TimeOfDay::new(22, 0).unwrap(),
            price: 100.0,
            max_players: 2,
            status: SlotStatus::Available,
            is_public: true,
        }
    }

    fn booking_created(slot_id: Ulid) -> Event {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                user_id: None,
                slot_id: Some(slot_id),
                date: start,
                start_time: TimeOfDay::new(18, 0).unwrap(),
                duration: 60,
                platform: Platform::Console,
                status: BookingStatus::Upcoming,
                source: BookingSource::Offline,
                payment_method: None,
                total_price: None,
                is_admin_extended: false,
                extension_reason: None,
                extension_admin_id: None,
                extension_payment_method: None,
                idempotency_key: None,
                created_at: start,
            },
            deduction: None,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let sid = Ulid::new();
        let events = vec![Event::SlotCreated { slot: slot(sid) }, booking_created(sid)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = Event::SlotCreated { slot: slot(Ulid::new()) };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn appends_after_a_torn_tail_survive_restart() {
        let path = tmp_path("torn_then_append.wal");
        let sid = Ulid::new();
        let created = Event::SlotCreated { slot: slot(sid) };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![created.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let next = booking_created(sid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&next).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![created, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_an_unsynced_batch() {
        let path = tmp_path("rollback.wal");
        let sid = Ulid::new();
        let created = Event::SlotCreated { slot: slot(sid) };

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&created).unwrap();

        // Half a record reaches the file, the rest is still buffered.
        wal.append_buffered(&booking_created(sid)).unwrap();
        wal.writer.get_mut().write_all(&[9u8; 5]).unwrap();
        wal.rollback().unwrap();

        let next = booking_created(sid);
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![created, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_missing_file_is_empty() {
        let path = tmp_path("recover_missing.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::SlotCreated { slot: slot(Ulid::new()) };
        let bad = Event::SlotDeleted {
            id: Ulid::new(),
            platform: Platform::Vr,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let sid = Ulid::new();
        let created = Event::SlotCreated { slot: slot(sid) };

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&created).unwrap();
        for _ in 0..10 {
            let booking = booking_created(sid);
            let id = booking.booking_id().unwrap();
            wal.append(&booking).unwrap();
            wal.append(&Event::BookingDeleted {
                id,
                slot_id: Some(sid),
                platform: Platform::Console,
            })
            .unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&created)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let next = booking_created(sid);
        wal.append(&next).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![created, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count_until_flushed() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5)
            .map(|_| Event::SlotCreated { slot: slot(Ulid::new()) })
            .collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
