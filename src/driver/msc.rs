//! Mass Storage Class driver (Bulk-Only Transport)
//!
//! Runs SCSI over a pair of bulk endpoints: the host sends a 31-byte Command
//! Block Wrapper, data moves in the direction the CBW announced, and the device
//! closes the command with a 13-byte Command Status Wrapper. The cycle is a
//! fixed four-stage machine: `Cmd -> Data -> Status -> StatusSent -> Cmd`.
//!
//! The storage itself lives behind the [`MscHandler`] trait. The driver answers
//! the mandatory SCSI commands (INQUIRY, READ CAPACITY, REQUEST SENSE, ...)
//! itself, chunks READ(10)/WRITE(10) through its own buffer so the handler only
//! ever sees pieces of at most `BUF_SIZE` bytes, and keeps the sense triple that
//! the host collects with REQUEST SENSE after a failed command.
//!
//! Note that CBW/CSW fields are little-endian while every multi-byte field
//! inside a SCSI command block or response is big-endian.

use super::ClassDriver;
use crate::bus::DeviceBus;
use crate::descriptor::{self, InterfaceDescriptor};
use crate::types::{ControlStage, EndpointAddress, SetupPacket, TransferType, XferResult};
use crate::UsbDevice;
use defmt::{error, trace, warn};
use usb_device::control::RequestType;
use usb_device::UsbDirection;

/// bInterfaceClass of mass storage
pub const CLASS_MSC: u8 = 0x08;
/// bInterfaceSubClass for SCSI transparent command sets
pub const SUBCLASS_SCSI: u8 = 0x06;
/// bInterfaceProtocol for Bulk-Only Transport
pub const PROTOCOL_BOT: u8 = 0x50;

/// "USBC", start of every Command Block Wrapper
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// "USBS", start of every Command Status Wrapper
pub const CSW_SIGNATURE: u32 = 0x53425355;

const REQ_GET_MAX_LUN: u8 = 0xFE;
const REQ_RESET: u8 = 0xFF;

/// SCSI operation codes and sense keys used by the built-in command set
pub mod scsi {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    pub const READ_FORMAT_CAPACITY: u8 = 0x23;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;

    pub const SENSE_NOT_READY: u8 = 0x02;
    pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
    pub const SENSE_DATA_PROTECT: u8 = 0x07;
}

/// 31-byte header carrying a SCSI command block from host to device.
///
/// All fields little-endian; the embedded `command` block uses big-endian
/// fields of its own.
#[derive(Clone, Copy, Default, PartialEq)]
pub struct CommandBlockWrapper {
    pub signature: u32,
    pub tag: u32,
    /// Bytes the host will move in the data stage (0 = no data stage)
    pub total_bytes: u32,
    /// Bit 7: 1 = device to host
    pub dir: u8,
    pub lun: u8,
    /// Valid length of `command`, 1..=16
    pub cmd_len: u8,
    pub command: [u8; 16],
}

impl CommandBlockWrapper {
    pub const LEN: usize = 31;

    pub fn parse(input: &[u8]) -> Option<CommandBlockWrapper> {
        let (_, cbw) = parse_cbw(input).ok()?;
        Some(cbw)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0..4].copy_from_slice(&self.signature.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.total_bytes.to_le_bytes());
        bytes[12] = self.dir;
        bytes[13] = self.lun;
        bytes[14] = self.cmd_len;
        bytes[15..31].copy_from_slice(&self.command);
        bytes
    }

    /// Data stage direction: device to host?
    pub fn is_in(&self) -> bool {
        self.dir & 0x80 != 0
    }

    /// Logical block address of a READ(10)/WRITE(10) command (big endian)
    pub fn lba(&self) -> u32 {
        u32::from_be_bytes([
            self.command[2],
            self.command[3],
            self.command[4],
            self.command[5],
        ])
    }

    /// Block count of a READ(10)/WRITE(10) command (big endian)
    pub fn block_count(&self) -> u16 {
        u16::from_be_bytes([self.command[7], self.command[8]])
    }
}

fn parse_cbw(input: &[u8]) -> nom::IResult<&[u8], CommandBlockWrapper> {
    use nom::bytes::streaming::take;
    use nom::number::streaming::{le_u32, u8};
    use nom::sequence::tuple;

    let (input, (signature, tag, total_bytes, dir, lun, cmd_len)) =
        tuple((le_u32, le_u32, le_u32, u8, u8, u8))(input)?;
    let (input, cmd) = take(16usize)(input)?;
    let mut command = [0u8; 16];
    command.copy_from_slice(cmd);
    Ok((
        input,
        CommandBlockWrapper {
            signature,
            tag,
            total_bytes,
            dir,
            lun,
            cmd_len,
            command,
        },
    ))
}

/// Command outcome reported in the CSW
#[derive(Clone, Copy, PartialEq, defmt::Format)]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

impl Default for CswStatus {
    fn default() -> Self {
        CswStatus::Passed
    }
}

/// 13-byte trailer closing every command, echoing the CBW's tag
#[derive(Clone, Copy, Default, PartialEq)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    /// Difference between what the CBW announced and what actually moved
    pub data_residue: u32,
    pub status: CswStatus,
}

impl CommandStatusWrapper {
    pub const LEN: usize = 13;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        bytes[12] = self.status as u8;
        bytes
    }

    pub fn parse(input: &[u8]) -> Option<CommandStatusWrapper> {
        if input.len() < Self::LEN {
            return None;
        }
        let signature = u32::from_le_bytes([input[0], input[1], input[2], input[3]]);
        if signature != CSW_SIGNATURE {
            return None;
        }
        let status = match input[12] {
            0 => CswStatus::Passed,
            1 => CswStatus::Failed,
            2 => CswStatus::PhaseError,
            _ => return None,
        };
        Some(CommandStatusWrapper {
            tag: u32::from_le_bytes([input[4], input[5], input[6], input[7]]),
            data_residue: u32::from_le_bytes([input[8], input[9], input[10], input[11]]),
            status,
        })
    }
}

/// The command failed; the CSW reports `Failed` and the sense triple tells why
#[derive(Clone, Copy, PartialEq)]
pub struct CommandError;

/// Identification strings for the INQUIRY response, space padded
#[derive(Clone, Copy)]
pub struct InquiryData {
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_rev: [u8; 4],
}

impl Default for InquiryData {
    fn default() -> Self {
        Self {
            vendor_id: [b' '; 8],
            product_id: [b' '; 16],
            product_rev: [b' '; 4],
        }
    }
}

impl InquiryData {
    /// Build from string literals; longer inputs are cut, shorter ones space padded
    pub fn new(vendor_id: &str, product_id: &str, product_rev: &str) -> Self {
        fn copy_padded(dest: &mut [u8], src: &str) {
            let n = src.len().min(dest.len());
            dest[..n].copy_from_slice(&src.as_bytes()[..n]);
        }

        let mut data = Self::default();
        copy_padded(&mut data.vendor_id, vendor_id);
        copy_padded(&mut data.product_id, product_id);
        copy_padded(&mut data.product_rev, product_rev);
        data
    }
}

/// The storage backing an MSC interface.
///
/// All methods run on the device task and must not block; a backend that is
/// momentarily not ready returns `Ok(0)` from [`MscHandler::read10`] /
/// [`MscHandler::write10`] and is retried.
pub trait MscHandler {
    /// Identification strings for the INQUIRY response
    fn inquiry(&mut self, lun: u8) -> InquiryData;

    /// Is the unit ready to accept commands?
    fn test_unit_ready(&mut self, lun: u8) -> bool;

    /// `(block_count, block_size)` of the medium. Either being zero means
    /// the medium is not ready and fails capacity requests.
    fn capacity(&mut self, lun: u8) -> (u32, u16);

    /// Copy data starting at `lba` plus `offset` bytes into `buf`.
    ///
    /// Returns the number of bytes produced (callers accept less than
    /// `buf.len()`), `Ok(0)` if the medium is not ready yet (the same read is
    /// retried), or `Err` to fail the command.
    fn read10(&mut self, lun: u8, lba: u32, offset: u32, buf: &mut [u8])
        -> Result<usize, CommandError>;

    /// Accept data written at `lba` plus `offset` bytes.
    ///
    /// Returns the number of bytes consumed. Consuming less than `data.len()`
    /// (including zero) is allowed: the remainder is offered again on the next
    /// call, letting block-oriented backends take exactly one block at a time.
    /// `Err` fails the command.
    fn write10(&mut self, lun: u8, lba: u32, offset: u32, data: &[u8])
        -> Result<usize, CommandError>;

    /// A `false` here makes WRITE(10) fail with DATA PROTECT sense
    fn is_writable(&mut self, _lun: u8) -> bool {
        true
    }

    /// Number of logical units. Zero stalls GET MAX LUN.
    fn max_lun(&mut self) -> u8 {
        1
    }

    fn start_stop(&mut self, _lun: u8, _power_condition: u8, _start: bool, _load_eject: bool) -> bool {
        true
    }

    fn prevent_allow_medium_removal(&mut self, _lun: u8, _prohibit: bool) -> bool {
        true
    }

    /// Any SCSI command the driver does not answer itself ends up here.
    /// `Ok(n)` responds with the first `n` bytes of `buf`.
    fn scsi_command(
        &mut self,
        _lun: u8,
        _command: &[u8; 16],
        _buf: &mut [u8],
    ) -> Result<usize, CommandError> {
        Err(CommandError)
    }

    /// The CSW for a READ(10) went out
    fn read10_complete(&mut self, _lun: u8) {}

    /// The CSW for a WRITE(10) went out (flush write-back caches here)
    fn write10_complete(&mut self, _lun: u8) {}

    /// The CSW for any other command went out
    fn scsi_complete(&mut self, _lun: u8, _command: &[u8; 16]) {}
}

#[derive(Clone, Copy, PartialEq, defmt::Format)]
enum Stage {
    Cmd,
    Data,
    Status,
    StatusSent,
}

/// What to do after handling a chunk of the data stage
enum DataOutcome {
    /// Keep accumulating
    Continue,
    /// A self-completion for the leftover bytes was queued; stop here
    Replay,
    /// The command failed; the stage machine is already at `Status`
    Abort,
}

/// MSC interface state.
///
/// `BUF_SIZE` is the data-stage buffer: READ(10)/WRITE(10) transfers of any
/// size are chunked through it. It must hold at least one block (and no less
/// than 36 bytes, for the INQUIRY response).
pub struct MscClass<H, const BUF_SIZE: usize = 512> {
    handler: H,
    itf_num: u8,
    ep_in: EndpointAddress,
    ep_out: EndpointAddress,
    cbw: CommandBlockWrapper,
    csw: CommandStatusWrapper,
    stage: Stage,
    /// Bytes to move in the current data stage
    total_len: u32,
    /// Bytes moved so far
    xferred_len: u32,
    sense_key: u8,
    add_sense_code: u8,
    add_sense_qualifier: u8,
    /// The next OUT completion replays bytes already sitting in `buf`
    replay_out: bool,
    buf: [u8; BUF_SIZE],
}

impl<H: MscHandler, const BUF_SIZE: usize> MscClass<H, BUF_SIZE> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            itf_num: 0,
            ep_in: EndpointAddress::new(0, UsbDirection::In),
            ep_out: EndpointAddress::new(0, UsbDirection::Out),
            cbw: CommandBlockWrapper::default(),
            csw: CommandStatusWrapper::default(),
            stage: Stage::Cmd,
            total_len: 0,
            xferred_len: 0,
            sense_key: 0,
            add_sense_code: 0,
            add_sense_qualifier: 0,
            replay_out: false,
            buf: [0; BUF_SIZE],
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Record sense data for the host's next REQUEST SENSE
    pub fn set_sense(&mut self, _lun: u8, key: u8, code: u8, qualifier: u8) {
        self.sense_key = key;
        self.add_sense_code = code;
        self.add_sense_qualifier = qualifier;
    }

    fn set_default_sense(&mut self, lun: u8, key: u8, code: u8, qualifier: u8) {
        if self.sense_key == 0 {
            self.set_sense(lun, key, code, qualifier);
        }
    }

    /// Rewind the transport. Sense data survives: the host is entitled to
    /// collect it with REQUEST SENSE even after a bus reset.
    fn clear_state(&mut self) {
        self.cbw = CommandBlockWrapper::default();
        self.csw = CommandStatusWrapper::default();
        self.stage = Stage::Cmd;
        self.total_len = 0;
        self.xferred_len = 0;
        self.replay_out = false;
    }

    /// Post the 31-byte CBW buffer on the OUT endpoint
    fn prepare_for_command<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>) {
        if usb
            .edpt_xfer_out(self.ep_out, CommandBlockWrapper::LEN)
            .is_err()
        {
            error!("MSC: failed to post CBW buffer");
        }
    }

    /// Block size of the running READ(10)/WRITE(10), derived from the CBW
    fn rw_block_size(&self) -> Option<u32> {
        let count = self.cbw.block_count() as u32;
        if count == 0 {
            return None;
        }
        let size = self.cbw.total_bytes / count;
        if size == 0 {
            None
        } else {
            Some(size)
        }
    }

    /// Fail the running command and jump to the status stage
    fn data_stage_failed(&mut self, key: u8, code: u8) {
        self.csw.data_residue = self.cbw.total_bytes - self.xferred_len;
        self.csw.status = CswStatus::Failed;
        self.stage = Stage::Status;
        trace!("-> Status");
        self.set_sense(self.cbw.lun, key, code, 0x00);
    }

    /// Ask the handler for the next READ(10) chunk and queue it on the IN endpoint
    fn read10_chunk<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>) {
        let Some(block_size) = self.rw_block_size() else {
            self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
            usb.edpt_stall(self.ep_in);
            return;
        };
        let lba = self.cbw.lba() + self.xferred_len / block_size;
        let offset = self.xferred_len % block_size;
        let chunk = (BUF_SIZE as u32).min(self.cbw.total_bytes - self.xferred_len) as usize;

        match self
            .handler
            .read10(self.cbw.lun, lba, offset, &mut self.buf[..chunk])
        {
            Err(_) => {
                self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
                usb.edpt_stall(self.ep_in);
            }
            Ok(0) => {
                // not ready: queue a zero-length completion to ourselves and
                // retry with the same parameters when it fires
                let queued = usb.events().xfer_complete(self.ep_in, XferResult::Success, 0);
                assert!(queued.is_ok(), "event queue overflow");
            }
            Ok(produced) => {
                let produced = produced.min(chunk);
                if usb.edpt_xfer_in(self.ep_in, &self.buf[..produced]).is_err() {
                    self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
                    usb.edpt_stall(self.ep_in);
                }
            }
        }
    }

    /// Arm the OUT endpoint for the next WRITE(10) chunk
    fn write10_chunk<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>) {
        if !self.handler.is_writable(self.cbw.lun) {
            // refuse the whole data stage: the host sees the halt, clears it
            // and collects the failed CSW
            self.csw.data_residue = self.cbw.total_bytes;
            self.csw.status = CswStatus::Failed;
            self.set_sense(self.cbw.lun, scsi::SENSE_DATA_PROTECT, 0x27, 0x00);
            usb.edpt_stall(self.ep_out);
            self.stage = Stage::Status;
            trace!("-> Status");
            return;
        }

        let chunk = (BUF_SIZE as u32).min(self.cbw.total_bytes - self.xferred_len) as usize;
        if usb.edpt_xfer_out(self.ep_out, chunk).is_err() {
            error!("MSC: failed to arm WRITE10 chunk");
            self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
        }
    }

    /// A WRITE(10) chunk arrived (or is being replayed); feed it to the handler
    fn write10_data<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>, len: usize) -> DataOutcome {
        if self.replay_out {
            // the bytes are already at the start of `buf`
            self.replay_out = false;
        } else {
            let received = usb.received(self.ep_out, len);
            self.buf[..len].copy_from_slice(&received[..len]);
        }

        let Some(block_size) = self.rw_block_size() else {
            self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
            return DataOutcome::Abort;
        };
        let lba = self.cbw.lba() + self.xferred_len / block_size;
        let offset = self.xferred_len % block_size;

        match self
            .handler
            .write10(self.cbw.lun, lba, offset, &self.buf[..len])
        {
            Err(_) => {
                self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
                DataOutcome::Abort
            }
            Ok(consumed) if consumed < len => {
                // partial consume: move the tail to the front and fire this
                // callback again for it, without advancing past the tail
                if consumed > 0 {
                    self.xferred_len += consumed as u32;
                    self.buf.copy_within(consumed..len, 0);
                }
                self.replay_out = true;
                let queued = usb.events().xfer_complete(
                    self.ep_out,
                    XferResult::Success,
                    (len - consumed) as u32,
                );
                assert!(queued.is_ok(), "event queue overflow");
                DataOutcome::Replay
            }
            Ok(_) => DataOutcome::Continue,
        }
    }

    /// Handle a command that is neither READ(10) nor WRITE(10)
    fn run_command<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>) {
        let cbw = self.cbw;

        if cbw.total_bytes > 0 && !cbw.is_in() {
            // the command's data stage comes first; run it once the data arrived
            let chunk = (cbw.total_bytes as usize).min(BUF_SIZE);
            if usb.edpt_xfer_out(self.ep_out, chunk).is_err() {
                error!("MSC: failed to arm data stage");
            }
            return;
        }

        let response = match self.builtin_scsi() {
            Some(result) => result,
            None => {
                let limit = (cbw.total_bytes as usize).min(BUF_SIZE);
                self.handler
                    .scsi_command(cbw.lun, &cbw.command, &mut self.buf[..limit])
            }
        };

        match response {
            Err(_) => {
                self.total_len = 0;
                self.csw.status = CswStatus::Failed;
                self.stage = Stage::Status;
                trace!("-> Status");
                // failed without a reason recorded: default to Illegal Request
                self.set_default_sense(cbw.lun, scsi::SENSE_ILLEGAL_REQUEST, 0x20, 0x00);
                // the host expects data it will never get
                if cbw.total_bytes > 0 {
                    usb.edpt_stall(self.ep_in);
                }
            }
            Ok(len) => {
                // never return more than the host asked for (hosts may pass a
                // short allocation length)
                let len = len.min(BUF_SIZE).min(cbw.total_bytes as usize);
                self.total_len = len as u32;
                self.csw.data_residue = cbw.total_bytes - len as u32;
                self.csw.status = CswStatus::Passed;
                if len > 0 {
                    if usb.edpt_xfer_in(self.ep_in, &self.buf[..len]).is_err() {
                        error!("MSC: failed to queue SCSI response");
                        self.data_stage_failed(scsi::SENSE_ILLEGAL_REQUEST, 0x20);
                    }
                } else {
                    self.stage = Stage::Status;
                    trace!("-> Status");
                }
            }
        }
    }

    /// The SCSI commands every MSC device must answer, served from `buf`.
    ///
    /// `None` means "not built in"; the handler's
    /// [`scsi_command`](MscHandler::scsi_command) gets a chance instead.
    fn builtin_scsi(&mut self) -> Option<Result<usize, CommandError>> {
        let lun = self.cbw.lun;
        let command = self.cbw.command;

        let result = match command[0] {
            scsi::TEST_UNIT_READY => {
                if self.handler.test_unit_ready(lun) {
                    Ok(0)
                } else {
                    self.set_default_sense(lun, scsi::SENSE_NOT_READY, 0x04, 0x00);
                    Err(CommandError)
                }
            }
            scsi::START_STOP_UNIT => {
                let power_condition = command[4] >> 4;
                let start = command[4] & 0x01 != 0;
                let load_eject = command[4] & 0x02 != 0;
                if self
                    .handler
                    .start_stop(lun, power_condition, start, load_eject)
                {
                    Ok(0)
                } else {
                    self.set_default_sense(lun, scsi::SENSE_NOT_READY, 0x04, 0x00);
                    Err(CommandError)
                }
            }
            scsi::PREVENT_ALLOW_MEDIUM_REMOVAL => {
                let prohibit = command[4] & 0x01 != 0;
                if self.handler.prevent_allow_medium_removal(lun, prohibit) {
                    Ok(0)
                } else {
                    self.set_default_sense(lun, scsi::SENSE_NOT_READY, 0x04, 0x00);
                    Err(CommandError)
                }
            }
            scsi::READ_CAPACITY_10 => {
                let (block_count, block_size) = self.handler.capacity(lun);
                if block_count == 0 || block_size == 0 {
                    self.set_default_sense(lun, scsi::SENSE_NOT_READY, 0x04, 0x00);
                    Err(CommandError)
                } else {
                    // last LBA and block size, both big-endian
                    self.buf[0..4].copy_from_slice(&(block_count - 1).to_be_bytes());
                    self.buf[4..8].copy_from_slice(&(block_size as u32).to_be_bytes());
                    Ok(8)
                }
            }
            scsi::READ_FORMAT_CAPACITY => {
                let (block_count, block_size) = self.handler.capacity(lun);
                if block_count == 0 || block_size == 0 {
                    self.set_default_sense(lun, scsi::SENSE_NOT_READY, 0x04, 0x00);
                    Err(CommandError)
                } else {
                    let mut response = [0u8; 12];
                    response[3] = 8; // one capacity descriptor follows
                    response[4..8].copy_from_slice(&block_count.to_be_bytes());
                    response[8] = 2; // formatted media
                    response[10..12].copy_from_slice(&block_size.to_be_bytes());
                    self.buf[..12].copy_from_slice(&response);
                    Ok(12)
                }
            }
            scsi::INQUIRY => {
                let data = self.handler.inquiry(lun);
                let mut response = [0u8; 36];
                response[1] = 0x80; // removable medium
                response[2] = 2; // SPC-2
                response[3] = 2; // response data format
                response[8..16].copy_from_slice(&data.vendor_id);
                response[16..32].copy_from_slice(&data.product_id);
                response[32..36].copy_from_slice(&data.product_rev);
                self.buf[..36].copy_from_slice(&response);
                Ok(36)
            }
            scsi::MODE_SENSE_6 => {
                let write_protected = !self.handler.is_writable(lun);
                let header = [3, 0, if write_protected { 0x80 } else { 0 }, 0];
                self.buf[..4].copy_from_slice(&header);
                Ok(4)
            }
            scsi::REQUEST_SENSE => {
                let mut response = [0u8; 18];
                response[0] = 0xF0; // fixed format, current error, valid
                response[2] = self.sense_key & 0xF;
                response[7] = 10; // additional sense length
                response[12] = self.add_sense_code;
                response[13] = self.add_sense_qualifier;
                self.buf[..18].copy_from_slice(&response);
                // sense is reported exactly once
                self.set_sense(lun, 0, 0, 0);
                Ok(18)
            }
            _ => return None,
        };

        Some(result)
    }

    /// Handle a completed transfer while in the data stage.
    /// Returns `true` when the bottom-of-cycle status check must be skipped.
    fn continue_data<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>, len: usize) -> bool {
        if !self.cbw.is_in() {
            if self.cbw.command[0] == scsi::WRITE_10 {
                match self.write10_data(usb, len) {
                    DataOutcome::Replay => return true,
                    DataOutcome::Abort => return false,
                    DataOutcome::Continue => {}
                }
            } else {
                // data stage of some other OUT command: hand it to the handler
                let received = usb.received(self.ep_out, len);
                self.buf[..len].copy_from_slice(&received[..len]);
                let outcome =
                    self.handler
                        .scsi_command(self.cbw.lun, &self.cbw.command, &mut self.buf[..len]);
                match outcome {
                    Ok(_) => self.csw.status = CswStatus::Passed,
                    Err(_) => {
                        self.csw.status = CswStatus::Failed;
                        self.set_sense(self.cbw.lun, scsi::SENSE_ILLEGAL_REQUEST, 0x20, 0x00);
                    }
                }
            }
        }

        self.xferred_len += len as u32;

        if self.xferred_len >= self.total_len {
            self.stage = Stage::Status;
            trace!("-> Status");
        } else {
            // large READ(10)/WRITE(10) transfers move one buffer at a time
            match self.cbw.command[0] {
                scsi::READ_10 => self.read10_chunk(usb),
                scsi::WRITE_10 => self.write10_chunk(usb),
                _ => warn!("MSC: short data stage for command {}", self.cbw.command[0]),
            }
        }

        false
    }

    /// Send the CSW, or wait for the host to clear a halted endpoint first
    fn try_send_status<B: DeviceBus>(&mut self, usb: &mut UsbDevice<B>) {
        if usb.edpt_stalled(self.ep_in) || usb.edpt_stalled(self.ep_out) {
            // check again after the next event; the host's CLEAR_FEATURE is
            // processed in between
            let queued = usb.events().xfer_complete(self.ep_out, XferResult::Success, 0);
            assert!(queued.is_ok(), "event queue overflow");
            return;
        }

        self.stage = Stage::StatusSent;
        trace!("-> StatusSent");
        let csw = self.csw.to_bytes();
        if usb.edpt_xfer_in(self.ep_in, &csw).is_err() {
            error!("MSC: failed to queue CSW");
        }
    }
}

impl<B: DeviceBus, H: MscHandler, const BUF_SIZE: usize> ClassDriver<B> for MscClass<H, BUF_SIZE> {
    fn reset(&mut self, _usb: &mut UsbDevice<B>) {
        self.clear_state();
    }

    fn open(
        &mut self,
        usb: &mut UsbDevice<B>,
        itf: &InterfaceDescriptor,
        descriptors: &[u8],
    ) -> Option<usize> {
        // only SCSI over Bulk-Only Transport
        if itf.interface_class != CLASS_MSC
            || itf.interface_sub_class != SUBCLASS_SCSI
            || itf.interface_protocol != PROTOCOL_BOT
        {
            return None;
        }

        // interface descriptor plus exactly two bulk endpoints
        let drv_len =
            descriptor::INTERFACE_DESCRIPTOR_LEN + 2 * descriptor::ENDPOINT_DESCRIPTOR_LEN;
        if descriptors.len() < drv_len {
            return None;
        }

        self.itf_num = itf.interface_number;
        let (ep_out, ep_in) = usb
            .open_endpoint_pair(
                &descriptors[descriptor::INTERFACE_DESCRIPTOR_LEN..],
                TransferType::Bulk,
            )
            .ok()?;
        self.ep_out = ep_out;
        self.ep_in = ep_in;

        self.clear_state();
        trace!("-> Cmd");
        self.prepare_for_command(usb);

        Some(drv_len)
    }

    fn control_xfer(
        &mut self,
        usb: &mut UsbDevice<B>,
        stage: ControlStage,
        request: &SetupPacket,
    ) -> bool {
        // nothing to do at the DATA and ACK stages
        if stage != ControlStage::Setup {
            return true;
        }
        if request.request_kind() != RequestType::Class {
            return false;
        }

        match request.request {
            REQ_RESET => {
                trace!("MSC: bulk-only reset on interface {}", self.itf_num);
                self.clear_state();
                // if the OUT endpoint still has the old CBW posted it stays
                // usable; otherwise post a fresh one
                if !usb.edpt_busy(self.ep_out) {
                    self.prepare_for_command(usb);
                }
                usb.control_status(request)
            }
            REQ_GET_MAX_LUN => {
                let lun_count = self.handler.max_lun();
                // zero units cannot be reported; stall instead of underflowing
                if lun_count == 0 {
                    return false;
                }
                usb.control_respond(request, &[lun_count - 1])
            }
            _ => false,
        }
    }

    fn xfer_complete(
        &mut self,
        usb: &mut UsbDevice<B>,
        ep_addr: EndpointAddress,
        result: XferResult,
        len: usize,
    ) -> bool {
        match self.stage {
            Stage::Cmd => {
                // an IN completion here is the tail of the previous command's
                // status; nothing to do
                if ep_addr != self.ep_out {
                    return true;
                }
                if result != XferResult::Success || len != CommandBlockWrapper::LEN {
                    error!("MSC: invalid CBW transfer ({} bytes)", len);
                    return false;
                }
                let Some(cbw) = CommandBlockWrapper::parse(usb.received(self.ep_out, len)) else {
                    return false;
                };
                if cbw.signature != CBW_SIGNATURE {
                    // no recovery short of a bulk-only or bus reset
                    error!("MSC: bad CBW signature");
                    return false;
                }

                self.cbw = cbw;
                self.csw = CommandStatusWrapper {
                    tag: cbw.tag,
                    data_residue: 0,
                    status: CswStatus::Passed,
                };
                self.stage = Stage::Data;
                trace!("-> Data");
                self.total_len = cbw.total_bytes;
                self.xferred_len = 0;

                match cbw.command[0] {
                    scsi::READ_10 => self.read10_chunk(usb),
                    scsi::WRITE_10 => self.write10_chunk(usb),
                    _ => self.run_command(usb),
                }
            }

            Stage::Data => {
                if self.continue_data(usb, len) {
                    return true;
                }
            }

            // handled below once the halted endpoints are clear
            Stage::Status => {}

            Stage::StatusSent => {
                if ep_addr == self.ep_in && len == CommandStatusWrapper::LEN {
                    match self.cbw.command[0] {
                        scsi::READ_10 => self.handler.read10_complete(self.cbw.lun),
                        scsi::WRITE_10 => self.handler.write10_complete(self.cbw.lun),
                        _ => self.handler.scsi_complete(self.cbw.lun, &self.cbw.command),
                    }
                    self.stage = Stage::Cmd;
                    trace!("-> Cmd");
                    self.prepare_for_command(usb);
                }
            }
        }

        if self.stage == Stage::Status {
            self.try_send_status(usb);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl MscHandler for NullHandler {
        fn inquiry(&mut self, _lun: u8) -> InquiryData {
            InquiryData::new("Acme", "Widget", "0001")
        }
        fn test_unit_ready(&mut self, _lun: u8) -> bool {
            true
        }
        fn capacity(&mut self, _lun: u8) -> (u32, u16) {
            (0x1000, 512)
        }
        fn read10(
            &mut self,
            _lun: u8,
            _lba: u32,
            _offset: u32,
            buf: &mut [u8],
        ) -> Result<usize, CommandError> {
            Ok(buf.len())
        }
        fn write10(
            &mut self,
            _lun: u8,
            _lba: u32,
            _offset: u32,
            data: &[u8],
        ) -> Result<usize, CommandError> {
            Ok(data.len())
        }
    }

    fn class_with_command(command: &[u8]) -> MscClass<NullHandler, 512> {
        let mut class: MscClass<NullHandler, 512> = MscClass::new(NullHandler);
        class.cbw.command[..command.len()].copy_from_slice(command);
        class
    }

    #[test]
    fn test_cbw_round_trip() {
        let cbw = CommandBlockWrapper {
            signature: CBW_SIGNATURE,
            tag: 0xDEADBEEF,
            total_bytes: 2048,
            dir: 0x80,
            lun: 0,
            cmd_len: 10,
            command: [
                scsi::READ_10,
                0,
                0,
                0,
                0,
                100,
                0,
                0,
                4,
                0,
                0,
                0,
                0,
                0,
                0,
                0,
            ],
        };
        let bytes = cbw.to_bytes();
        assert_eq!(&bytes[0..4], &[0x55, 0x53, 0x42, 0x43]); // "USBC"
        let parsed = CommandBlockWrapper::parse(&bytes).unwrap();
        assert!(parsed == cbw);
        assert!(parsed.is_in());
        assert_eq!(parsed.lba(), 100);
        assert_eq!(parsed.block_count(), 4);
    }

    #[test]
    fn test_csw_round_trip() {
        let csw = CommandStatusWrapper {
            tag: 0xCAFEBABE,
            data_residue: 512,
            status: CswStatus::Failed,
        };
        let bytes = csw.to_bytes();
        assert_eq!(&bytes[0..4], &[0x55, 0x53, 0x42, 0x53]); // "USBS"
        assert_eq!(bytes[12], 1);
        let parsed = CommandStatusWrapper::parse(&bytes).unwrap();
        assert!(parsed == csw);
    }

    #[test]
    fn test_csw_rejects_bad_signature() {
        let mut bytes = CommandStatusWrapper::default().to_bytes();
        bytes[0] = 0;
        assert!(CommandStatusWrapper::parse(&bytes).is_none());
    }

    #[test]
    fn test_inquiry_response_layout() {
        let mut class = class_with_command(&[scsi::INQUIRY]);
        let len = class.builtin_scsi().unwrap().ok().unwrap();
        assert_eq!(len, 36);
        assert_eq!(class.buf[0], 0);
        assert_eq!(class.buf[1], 0x80);
        assert_eq!(class.buf[2], 2);
        assert_eq!(class.buf[3], 2);
        assert_eq!(&class.buf[8..16], b"Acme    ");
        assert_eq!(&class.buf[16..32], b"Widget          ");
        assert_eq!(&class.buf[32..36], b"0001");
    }

    #[test]
    fn test_read_capacity_is_big_endian() {
        let mut class = class_with_command(&[scsi::READ_CAPACITY_10]);
        let len = class.builtin_scsi().unwrap().ok().unwrap();
        assert_eq!(len, 8);
        // last LBA = 0x1000 - 1
        assert_eq!(&class.buf[0..4], &[0x00, 0x00, 0x0F, 0xFF]);
        assert_eq!(&class.buf[4..8], &[0x00, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_request_sense_reports_once() {
        let mut class = class_with_command(&[scsi::REQUEST_SENSE]);
        class.set_sense(0, scsi::SENSE_DATA_PROTECT, 0x27, 0x00);

        let len = class.builtin_scsi().unwrap().ok().unwrap();
        assert_eq!(len, 18);
        assert_eq!(class.buf[0], 0xF0);
        assert_eq!(class.buf[2], scsi::SENSE_DATA_PROTECT);
        assert_eq!(class.buf[7], 10);
        assert_eq!(class.buf[12], 0x27);

        // a second REQUEST SENSE sees cleared sense data
        class.builtin_scsi().unwrap().ok().unwrap();
        assert_eq!(class.buf[2], 0);
        assert_eq!(class.buf[12], 0);
    }

    #[test]
    fn test_mode_sense_reports_write_protection() {
        struct ReadOnly;
        impl MscHandler for ReadOnly {
            fn inquiry(&mut self, _lun: u8) -> InquiryData {
                InquiryData::default()
            }
            fn test_unit_ready(&mut self, _lun: u8) -> bool {
                true
            }
            fn capacity(&mut self, _lun: u8) -> (u32, u16) {
                (64, 512)
            }
            fn read10(
                &mut self,
                _lun: u8,
                _lba: u32,
                _offset: u32,
                buf: &mut [u8],
            ) -> Result<usize, CommandError> {
                Ok(buf.len())
            }
            fn write10(
                &mut self,
                _lun: u8,
                _lba: u32,
                _offset: u32,
                _data: &[u8],
            ) -> Result<usize, CommandError> {
                Err(CommandError)
            }
            fn is_writable(&mut self, _lun: u8) -> bool {
                false
            }
        }

        let mut class: MscClass<ReadOnly, 512> = MscClass::new(ReadOnly);
        class.cbw.command[0] = scsi::MODE_SENSE_6;
        let len = class.builtin_scsi().unwrap().ok().unwrap();
        assert_eq!(len, 4);
        assert_eq!(class.buf[..4], [3, 0, 0x80, 0]);
    }

    #[test]
    fn test_sense_survives_reset() {
        let mut class = class_with_command(&[scsi::TEST_UNIT_READY]);
        class.set_sense(0, scsi::SENSE_NOT_READY, 0x04, 0x00);
        class.clear_state();
        assert_eq!(class.sense_key, scsi::SENSE_NOT_READY);
        assert_eq!(class.add_sense_code, 0x04);
    }

    #[test]
    fn test_rw_block_size_guards_zero() {
        let mut class = class_with_command(&[scsi::READ_10]);
        class.cbw.total_bytes = 2048;
        // block count of zero must not divide
        assert!(class.rw_block_size().is_none());

        class.cbw.command[8] = 4;
        assert_eq!(class.rw_block_size(), Some(512));
    }
}
