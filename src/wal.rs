use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a frame may declare. A bigger length prefix can only come
/// from a torn or corrupt write.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes of framing around each payload: length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Write one frame and return its size on disk.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

enum Frame {
    /// An intact event and the number of bytes its frame occupied.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// A partial or damaged frame. Nothing after it is trusted.
    Torn(&'static str),
}

/// Fill `buf`, distinguishing a clean EOF before the first byte from a short read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn("short length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Frame::Torn("short payload"));
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? < 4 {
        return Ok(Frame::Torn("short checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Append-only event log.
///
/// Each frame is `[u32 len][bincode Event][u32 crc32]`, little-endian. Replay
/// stops at the first torn frame, which is what a crash mid-write leaves behind.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Bytes written through this handle, durable or not.
    written_len: u64,
    /// Length of the log as of the last successful fsync.
    synced_len: u64,
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

impl Wal {
    /// Open for appends. Run [`Wal::recover`] first so new frames never land
    /// behind a torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (file, len) = open_append(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            written_len: len,
            synced_len: len,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one frame. Durable only after [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.written_len += write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.written_len;
        Ok(())
    }

    /// Drop everything written since the last successful [`Wal::flush_sync`],
    /// whether still buffered or already in the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let (file, _) = open_append(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unflushed buffer instead of writing it.
        drop(stale.into_parts());
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.written_len = self.synced_len;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let (file, len) = open_append(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.written_len = len;
        self.synced_len = len;
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

    /// Read every intact frame. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut the file back to its last intact frame so later
    /// appends follow valid data.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact_len) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len > intact_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - intact_len,
                "truncating WAL to last intact frame"
            );
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Intact events and the byte offset where they end.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut offset = 0;
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    events.push(event);
                    offset += size;
                }
                Frame::End => break,
                Frame::Torn(why) => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = events.len(),
                        "discarding WAL tail: {why}"
                    );
                    break;
                }
            }
        }
        Ok((events, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CabinDetails, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("cabinbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn cabin_created(id: Ulid) -> Event {
        Event::CabinCreated {
            id,
            owner: "kari".into(),
            details: CabinDetails {
                address: "Fjellveien 1".into(),
                squarage_property: 1200,
                squarage_cabin: 85,
                sauna: true,
                beachfront: false,
            },
        }
    }

    fn listed(cabin_id: Ulid, start: i64, end: i64) -> Event {
        Event::AdvertListed {
            id: Ulid::new(),
            cabin_id,
            price_per_day: 900,
            span: Span::new(start, end),
            created_by: "kari".into(),
        }
    }

    #[test]
    fn appended_events_replay_in_order() {
        let path = tmp_path("replay_order.wal");
        let cabin = Ulid::new();
        let events = vec![cabin_created(cabin), listed(cabin, 0, 10), listed(cabin, 20, 30)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let first = cabin_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // Length prefix promising 64 bytes, followed by only 3.
            f.write_all(&64u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }

    #[test]
    fn appends_after_torn_tail_survive_restart() {
        let path = tmp_path("torn_then_append.wal");
        let cabin = Ulid::new();
        let first = cabin_created(cabin);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&64u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        let second = listed(cabin, 0, 10);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn recover_leaves_clean_log_untouched() {
        let path = tmp_path("recover_clean.wal");
        let event = cabin_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap(), vec![event]);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
        assert!(Wal::recover(&tmp_path("recover_missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn rollback_discards_unsynced_frames() {
        let path = tmp_path("rollback.wal");
        let cabin = Ulid::new();
        let kept = cabin_created(cabin);
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        // One frame pushed to the file, one still buffered.
        wal.append_buffered(&listed(cabin, 0, 10)).unwrap();
        wal.writer.flush().unwrap();
        wal.append_buffered(&listed(cabin, 20, 30)).unwrap();
        wal.rollback().unwrap();

        let later = listed(cabin, 40, 50);
        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = cabin_created(Ulid::new());
        let bad = Event::CabinDeleted { id: Ulid::new() };
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
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp_path("oversized.wal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let cabin = Ulid::new();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&cabin_created(cabin)).unwrap();
        for i in 0..20 {
            let event = listed(cabin, i * 100, i * 100 + 50);
            let Event::AdvertListed { id, .. } = event else {
                unreachable!()
            };
            wal.append(&event).unwrap();
            wal.append(&Event::AdvertWithdrawn { id, cabin_id: cabin }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![cabin_created(cabin)];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = listed(cabin, 5000, 6000);
        wal.append(&later).unwrap();
        drop(wal);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), later]);
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let cabin = Ulid::new();
        let events: Vec<Event> = (0..5).map(|i| listed(cabin, i * 10, i * 10 + 5)).collect();
        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
