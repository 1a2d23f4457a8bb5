// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `SpaBuffer`: the buffer descriptor communicated over the control
//! socket by `add_buffer`/`use_buffers` (distinct from the RT event
//! rings in [`crate::connection`], which carry the data itself).
//! A `Data` entry points at memory one of three ways, resolved
//! against whatever `add_mem` has announced for this node.

use std::collections::HashSet;

use crate::error::{Error, ProtocolError};
use crate::pod::{Builder, Parser};

/// One of a buffer's data planes. `fd_index` and `mem_id` are only
/// meaningful relative to, respectively, the owning message's fd
/// table and the node's `add_mem` announcements — neither is
/// resolved here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Data {
    MemFd { fd_index: u32, offset: u32, size: u32 },
    MemPtr { offset_in_mem_id: u32 },
    MemId(u32),
}

const TAG_MEM_FD: u32 = 0;
const TAG_MEM_PTR: u32 = 1;
const TAG_MEM_ID: u32 = 2;

impl Data {
    fn write(&self, b: &mut Builder) {
        b.write_struct(|b| match *self {
            Data::MemFd { fd_index, offset, size } => {
                b.write_id(TAG_MEM_FD);
                b.write_id(fd_index);
                b.write_int(offset as i32);
                b.write_int(size as i32);
            }
            Data::MemPtr { offset_in_mem_id } => {
                b.write_id(TAG_MEM_PTR);
                b.write_int(offset_in_mem_id as i32);
            }
            Data::MemId(id) => {
                b.write_id(TAG_MEM_ID);
                b.write_id(id);
            }
        });
    }

    fn parse(mut fields: Parser<'_>) -> Result<Self, Error> {
        let tag = next(&mut fields)?.as_id()?;
        match tag {
            TAG_MEM_FD => {
                let fd_index = next(&mut fields)?.as_id()?;
                let offset = next(&mut fields)?.as_int()? as u32;
                let size = next(&mut fields)?.as_int()? as u32;
                Ok(Data::MemFd { fd_index, offset, size })
            }
            TAG_MEM_PTR => {
                let offset_in_mem_id = next(&mut fields)?.as_int()? as u32;
                Ok(Data::MemPtr { offset_in_mem_id })
            }
            TAG_MEM_ID => Ok(Data::MemId(next(&mut fields)?.as_id()?)),
            _ => Err(Error::Protocol(ProtocolError::Decode)),
        }
    }
}

/// `{ id, n_metas, metas[], n_datas, datas[] }`. `metas` are opaque
/// type-tagged byte blobs (header/chunk/ringbuffer metadata); this
/// layer does not interpret their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaBuffer {
    pub id: u32,
    pub metas: Vec<(u32, Vec<u8>)>,
    pub datas: Vec<Data>,
}

impl SpaBuffer {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        Builder::new(buf).write_struct(|b| {
            b.write_id(self.id);
            b.write_int(self.metas.len() as i32);
            for (ty, bytes) in &self.metas {
                b.write_struct(|b| {
                    b.write_id(*ty);
                    b.write_bytes(bytes);
                });
            }
            b.write_int(self.datas.len() as i32);
            for data in &self.datas {
                data.write(b);
            }
        });
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let pod = crate::pod::parse_one(payload)?;
        let mut fields = pod.as_struct()?;
        let id = next(&mut fields)?.as_id()?;
        let n_metas = next(&mut fields)?.as_int()? as usize;
        let mut metas = Vec::with_capacity(n_metas);
        for _ in 0..n_metas {
            let mut meta_fields = next(&mut fields)?.as_struct()?;
            let ty = next(&mut meta_fields)?.as_id()?;
            let bytes = next(&mut meta_fields)?.as_bytes()?.to_vec();
            metas.push((ty, bytes));
        }
        let n_datas = next(&mut fields)?.as_int()? as usize;
        let mut datas = Vec::with_capacity(n_datas);
        for _ in 0..n_datas {
            let data_fields = next(&mut fields)?.as_struct()?;
            datas.push(Data::parse(data_fields)?);
        }
        Ok(SpaBuffer { id, metas, datas })
    }

    /// Validates every `Data::MemId` this buffer references against
    /// `mems`, and every `Data::MemFd` against `n_fds` (strictly
    /// less-than — see [`crate::error::ProtocolError::FdIndexOutOfRange`]).
    pub fn validate(&self, mems: &MemRegistry, n_fds: u8) -> Result<(), Error> {
        for data in &self.datas {
            match *data {
                Data::MemId(id) => {
                    if !mems.contains(id) {
                        return Err(unknown_mem(id));
                    }
                }
                Data::MemFd { fd_index, .. } => {
                    if fd_index >= n_fds as u32 {
                        return Err(fd_out_of_range(fd_index, n_fds));
                    }
                }
                Data::MemPtr { .. } => {}
            }
        }
        Ok(())
    }
}

fn unknown_mem(id: u32) -> Error {
    Error::Protocol(ProtocolError::UnknownMemId(id))
}

fn fd_out_of_range(index: u32, n_fds: u8) -> Error {
    Error::Protocol(ProtocolError::FdIndexOutOfRange { index, n_fds })
}

fn next<'d>(p: &mut Parser<'d>) -> Result<crate::pod::Pod<'d>, Error> {
    p.next().ok_or(Error::Protocol(ProtocolError::Truncated))?
}

/// Tracks which `mem_id`s a node's `add_mem` announcements currently
/// cover, so [`SpaBuffer::validate`] can enforce "every `MemId` a
/// buffer names must have been announced and not yet removed."
#[derive(Debug, Default)]
pub struct MemRegistry {
    announced: HashSet<u32>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&mut self, mem_id: u32) {
        self.announced.insert(mem_id);
    }

    pub fn remove(&mut self, mem_id: u32) {
        self.announced.remove(&mem_id);
    }

    pub fn contains(&self, mem_id: u32) -> bool {
        self.announced.contains(&mem_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_mem_id() {
        let buf = SpaBuffer {
            id: 3,
            metas: vec![(0, vec![1, 2, 3, 4])],
            datas: vec![Data::MemId(7)],
        };
        let mut bytes = Vec::new();
        buf.encode(&mut bytes);
        let decoded = SpaBuffer::decode(&bytes).unwrap();
        assert_eq!(buf, decoded);
    }

    #[test]
    fn round_trip_mem_fd_and_ptr() {
        let buf = SpaBuffer {
            id: 0,
            metas: vec![],
            datas: vec![
                Data::MemFd { fd_index: 1, offset: 0, size: 4096 },
                Data::MemPtr { offset_in_mem_id: 128 },
            ],
        };
        let mut bytes = Vec::new();
        buf.encode(&mut bytes);
        let decoded = SpaBuffer::decode(&bytes).unwrap();
        assert_eq!(buf, decoded);
    }

    #[test]
    fn validate_rejects_unannounced_mem_id() {
        let buf = SpaBuffer { id: 0, metas: vec![], datas: vec![Data::MemId(9)] };
        let mems = MemRegistry::new();
        assert!(matches!(
            buf.validate(&mems, 0),
            Err(Error::Protocol(ProtocolError::UnknownMemId(9)))
        ));
    }

    #[test]
    fn validate_rejects_fd_index_equal_to_n_fds() {
        // The legacy off-by-one: index == n_fds must be rejected, not
        // just index > n_fds.
        let buf = SpaBuffer {
            id: 0,
            metas: vec![],
            datas: vec![Data::MemFd { fd_index: 2, offset: 0, size: 0 }],
        };
        let mems = MemRegistry::new();
        assert!(matches!(
            buf.validate(&mems, 2),
            Err(Error::Protocol(ProtocolError::FdIndexOutOfRange { index: 2, n_fds: 2 }))
        ));
    }

    #[test]
    fn validate_accepts_announced_mem_id_and_in_range_fd() {
        let buf = SpaBuffer {
            id: 0,
            metas: vec![],
            datas: vec![Data::MemId(5), Data::MemFd { fd_index: 0, offset: 0, size: 4096 }],
        };
        let mut mems = MemRegistry::new();
        mems.announce(5);
        assert!(buf.validate(&mems, 1).is_ok());
    }

    #[test]
    fn validate_rejects_mem_id_after_removal() {
        let buf = SpaBuffer { id: 0, metas: vec![], datas: vec![Data::MemId(5)] };
        let mut mems = MemRegistry::new();
        mems.announce(5);
        mems.remove(5);
        assert!(buf.validate(&mems, 0).is_err());
    }
}
