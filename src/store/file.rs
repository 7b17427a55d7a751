use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::codec::{decode_line, RecordFormat};
use crate::layout::QueueLayout;
use crate::lock::{DirLock, QueueLock};
use crate::message::{
    is_redeliverable, DeleteMessageRequest, Message, MessageStatus, QueueDepth,
    ReceiveMessageRequest, SendMessageRequest,
};
use crate::store::{QueueStore, ReceiptSequence};
use crate::{Error, Result};

/// Durable store: one line-per-record log per queue.
///
/// Every operation holds the queue's lock for its whole read-modify-write, so
/// push, poll and delete on one queue are linearizable. Appends go straight
/// to the end of the log; any status change or removal rewrites the whole log
/// through a temporary file and an atomic rename.
///
/// New records are written in the configured [`RecordFormat`]; existing lines
/// are read in whichever format they carry. The highest receipt id issued for
/// a queue is kept next to its log, so receipts are never reissued across
/// reopened stores. Lines that fail to decode are
/// logged, never handed out, and kept on disk as they are.
pub struct FileQueueStore {
    layout: QueueLayout,
    format: RecordFormat,
    lock: Arc<dyn QueueLock>,
    clock: Arc<dyn Clock>,
    receipts: ReceiptSequence,
}

struct Record {
    line: usize,
    message: Message,
}

impl FileQueueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: QueueLayout::new(root),
            format: RecordFormat::default(),
            lock: Arc::new(DirLock::new()),
            clock: Arc::new(SystemClock),
            receipts: ReceiptSequence::new(),
        }
    }

    pub fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn QueueLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }
}

impl QueueStore for FileQueueStore {
    /// `delay_seconds` is not applied by this backend.
    fn push(&self, request: &SendMessageRequest) -> Result<()> {
        let paths = self.layout.queue_paths(&request.queue_id)?;
        // Encode up front so bad content fails before anything is written.
        let mut buf = String::new();
        for message in &request.messages {
            buf.push_str(&self.format.encode(&message.clone().into_new())?);
            buf.push('\n');
        }

        fs::create_dir_all(&paths.dir)?;
        let _guard = self.lock.acquire(&paths.lock)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&paths.messages)?;
        if missing_trailing_newline(&mut file)? {
            buf.insert(0, '\n');
        }
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        log::debug!(
            "appended {} records to {}",
            request.messages.len(),
            paths.messages.display()
        );
        Ok(())
    }

    fn poll(&self, request: &ReceiveMessageRequest) -> Result<Vec<Message>> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }
        let paths = self.layout.queue_paths(&request.queue_id)?;
        if !paths.messages.exists() {
            log::debug!("queue {} does not exist", request.queue_id);
            return Ok(Vec::new());
        }

        let _guard = self.lock.acquire(&paths.lock)?;
        let Some(mut lines) = read_log(&paths.messages)? else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let timeout = request.visibility_timeout();
        let records = decode_records(&lines, &paths.messages);
        let high_water = read_high_water(&paths.receipts)?;
        self.receipts.observe(high_water);
        if let Some(max) = records.iter().map(|record| record.message.receipt_id).max() {
            self.receipts.observe(max);
        }

        let mut selected: Vec<Record> = Vec::with_capacity(request.batch_size);
        let mut fresh = Vec::new();
        for record in records {
            if is_redeliverable(&record.message, now, timeout) {
                if selected.len() < request.batch_size {
                    selected.push(record);
                }
            } else if record.message.status == MessageStatus::New {
                fresh.push(record);
            }
        }
        for record in &mut selected {
            record.message.prior_attempts = record.message.prior_attempts.saturating_add(1);
        }
        let redelivered = selected.len();
        let remaining = request.batch_size - redelivered;
        selected.extend(fresh.into_iter().take(remaining));

        if selected.is_empty() {
            log::debug!("no eligible messages in {}", request.queue_id);
            return Ok(Vec::new());
        }

        let delivered_at = self.format.delivery_instant(now);
        let mut issued = high_water;
        for record in &mut selected {
            let receipt = self.receipts.next();
            issued = issued.max(receipt);
            record.message.deliver(delivered_at, receipt);
            lines[record.line] = self.format.encode(&record.message)?;
        }
        // Raised before the log changes so a receipt is never handed out twice,
        // even after its record has been deleted and the store reopened.
        write_high_water(&paths.receipts, issued)?;
        write_log(&paths.messages, &lines)?;
        log::debug!(
            "delivered {} records from {} ({redelivered} redelivered)",
            selected.len(),
            paths.messages.display()
        );
        Ok(selected.into_iter().map(|record| record.message).collect())
    }

    fn delete(&self, request: &DeleteMessageRequest) -> Result<usize> {
        let receipts: HashSet<u64> = request.receipts().collect();
        if receipts.is_empty() {
            return Ok(0);
        }
        let paths = self.layout.queue_paths(&request.queue_id)?;
        if !paths.messages.exists() {
            return Ok(0);
        }

        let _guard = self.lock.acquire(&paths.lock)?;
        let Some(lines) = read_log(&paths.messages)? else {
            return Ok(0);
        };
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| match decode_line(line) {
                Ok(message) => !(message.is_in_flight() && receipts.contains(&message.receipt_id)),
                Err(_) => true,
            })
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            write_log(&paths.messages, &kept)?;
        }
        log::debug!("deleted {removed} records from {}", paths.messages.display());
        Ok(removed)
    }

    fn depth(&self, queue_id: &str) -> Result<QueueDepth> {
        let paths = self.layout.queue_paths(queue_id)?;
        if !paths.messages.exists() {
            return Ok(QueueDepth::default());
        }
        let _guard = self.lock.acquire(&paths.lock)?;
        let Some(lines) = read_log(&paths.messages)? else {
            return Ok(QueueDepth::default());
        };
        let mut depth = QueueDepth::default();
        for record in decode_records(&lines, &paths.messages) {
            match record.message.status {
                MessageStatus::New => depth.new += 1,
                MessageStatus::InFlight => depth.in_flight += 1,
            }
        }
        Ok(depth)
    }
}

/// Non-blank lines of the log, or `None` when the log does not exist.
fn read_log(path: &Path) -> Result<Option<Vec<String>>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect(),
    ))
}

fn write_log(path: &Path, lines: &[String]) -> Result<()> {
    let mut data = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());
    for line in lines {
        data.push_str(line);
        data.push('\n');
    }
    replace_file(path, &data)
}

/// Highest receipt id ever issued for a queue; 0 before the first delivery.
fn read_high_water(path: &Path) -> Result<u64> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    contents.trim().parse::<u64>().map_err(|_| {
        Error::CorruptRecord(format!(
            "invalid receipt high-water mark {:?} in {}",
            contents.trim(),
            path.display()
        ))
    })
}

fn write_high_water(path: &Path, receipt_id: u64) -> Result<()> {
    replace_file(path, &format!("{receipt_id}\n"))
}

fn replace_file(path: &Path, data: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(data.as_bytes())?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn decode_records(lines: &[String], path: &Path) -> Vec<Record> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(line, text)| match decode_line(text) {
            Ok(message) => Some(Record { line, message }),
            Err(err) => {
                log::warn!("skipping record {} of {}: {err}", line + 1, path.display());
                None
            }
        })
        .collect()
}

fn missing_trailing_newline(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
