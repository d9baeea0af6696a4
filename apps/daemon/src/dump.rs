//! Append-only pcap dump of frames the RX pipeline rejected.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nan_wire::ByteWriter;

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;
/// LINKTYPE_IEEE802_11_RADIOTAP.
const PCAP_LINKTYPE: u32 = 127;

pub struct PcapDump {
    file: File,
}

impl PcapDump {
    /// Open the dump file, writing the global header if it is new.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        if file.seek(SeekFrom::End(0))? == 0 {
            let mut writer = ByteWriter::new();
            writer.write_le32(PCAP_MAGIC);
            writer.write_le16(PCAP_VERSION_MAJOR);
            writer.write_le16(PCAP_VERSION_MINOR);
            writer.write_le32(0); // thiszone
            writer.write_le32(0); // sigfigs
            writer.write_le32(PCAP_SNAPLEN);
            writer.write_le32(PCAP_LINKTYPE);
            file.write_all(
                &writer
                    .finish()
                    .map_err(|_| io::Error::from(io::ErrorKind::Other))?,
            )?;
        }

        Ok(Self { file })
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let mut writer = ByteWriter::new();
        writer.write_le32(elapsed.as_secs() as u32);
        writer.write_le32(elapsed.subsec_micros());
        writer.write_le32(frame.len() as u32);
        writer.write_le32(frame.len() as u32);
        writer.write_bytes(frame);
        self.file.write_all(
            &writer
                .finish()
                .map_err(|_| io::Error::from(io::ErrorKind::Other))?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn writes_header_once_and_records_after() {
        let dir = std::env::temp_dir().join("nand-dump-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("dump-{}.pcap", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut dump = PcapDump::open(&path).unwrap();
            dump.write_frame(&[1, 2, 3]).unwrap();
        }
        {
            let mut dump = PcapDump::open(&path).unwrap();
            dump.write_frame(&[4, 5]).unwrap();
        }

        let mut bytes = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
        std::fs::remove_file(&path).unwrap();

        // One global header, two records.
        assert_eq!(&bytes[..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(bytes.len(), 24 + (16 + 3) + (16 + 2));
        // Second record's length fields.
        let second = 24 + 16 + 3;
        assert_eq!(&bytes[second + 8..second + 12], &2u32.to_le_bytes());
    }
}
