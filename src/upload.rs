//! Server-to-client file upload records.
//!
//! A transfer is a FILE record (0x01: size + client-side name), a run of
//! DATA records (0x02: offset + block), and an END record (0x03: total size
//! plus two reserved bytes), each carried in a `PKT_SERVER_FILE_UPLOAD`
//! packet. Clients acknowledge records with the upload diagnostic; record
//! processing on the client is a collaborator concern.

use std::path::Path;

use crate::defaults;
use crate::errors::{CodecError, DmtpError};
use crate::packet::{server_packet, Packet};

pub const UPLOAD_TYPE_FILE: u8 = 0x01;
pub const UPLOAD_TYPE_DATA: u8 = 0x02;
pub const UPLOAD_TYPE_END: u8 = 0x03;

/// Build the full packet run for one file's contents.
pub fn upload_packets(client_name: &str, data: &[u8]) -> Result<Vec<Packet>, DmtpError> {
    if data.len() > defaults::UPLOAD_MAX_FILE_SIZE {
        return Err(DmtpError::Session(format!(
            "upload of {} bytes exceeds the {} byte limit",
            data.len(),
            defaults::UPLOAD_MAX_FILE_SIZE
        )));
    }
    let mut packets = Vec::with_capacity(data.len() / defaults::UPLOAD_BLOCK_SIZE + 2);

    packets.push(
        Packet::build(server_packet::FILE_UPLOAD, |w| {
            w.write_hex(UPLOAD_TYPE_FILE as u32, 1)?;
            w.write_hex(data.len() as u32, 3)?;
            w.write_str(client_name, defaults::UPLOAD_MAX_FILENAME_SIZE)
        })
        .map_err(wrap)?,
    );

    for (i, block) in data.chunks(defaults::UPLOAD_BLOCK_SIZE).enumerate() {
        let offset = (i * defaults::UPLOAD_BLOCK_SIZE) as u32;
        packets.push(
            Packet::build(server_packet::FILE_UPLOAD, |w| {
                w.write_hex(UPLOAD_TYPE_DATA as u32, 1)?;
                w.write_hex(offset, 3)?;
                w.write_bytes(block, block.len())
            })
            .map_err(wrap)?,
        );
    }

    packets.push(
        Packet::build(server_packet::FILE_UPLOAD, |w| {
            w.write_hex(UPLOAD_TYPE_END as u32, 1)?;
            w.write_hex(data.len() as u32, 3)?;
            w.write_hex(0, 1)?;
            w.write_hex(0, 1)
        })
        .map_err(wrap)?,
    );

    Ok(packets)
}

/// Read a local file and build its upload packet run.
pub fn upload_file(local: &Path, client_name: &str) -> Result<Vec<Packet>, DmtpError> {
    let data = std::fs::read(local).map_err(|e| {
        DmtpError::Session(format!("cannot read upload file {}: {}", local.display(), e))
    })?;
    upload_packets(client_name, &data)
}

fn wrap(e: CodecError) -> DmtpError {
    DmtpError::Codec(e)
}
