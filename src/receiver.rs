//! Receiving side of the image transfer protocol.
//!
//! The receiver is driven by polling: the UART interrupt pushes bytes into a single producer,
//! single consumer queue and the main loop hands the consumer to `ImageReceiver::poll`. Every
//! verified data frame is written to the store right away and answered with an ACK, so the host
//! only has to repeat single frames. Nothing is logged after a response has been handed to the
//! transmitter, the host would read it as part of the protocol.

use crate::FlashStore;
use crate::image::{self, IMAGE_PAGES, ImageId, MAX_FRAME_NUM};
use crate::platform::Platform;
use crate::protocol::{
    Command, DATA_FRAME_LEN, DataFrame, FrameAssembler, FrameEvent, Response, frame_num_of,
    parse_control,
};
#[cfg(feature = "defmt")]
use defmt::{debug, trace, warn};
use embedded_io::Write;
use heapless::spsc::Consumer;

/// Bitmap with a bit set for every page of an image
pub const FULL_BITMAP: u64 = (1 << IMAGE_PAGES) - 1;

#[derive(strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    Idle,
    WaitingData,
    VerifyComplete,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverConfig {
    /// Consecutive polls without a received byte after which a transfer is abandoned
    pub idle_timeout_polls: u32,
}

impl Default for ReceiverConfig {
    /// 3 seconds when polled from a 1 ms tick
    fn default() -> Self {
        Self {
            idle_timeout_polls: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferStats {
    pub state: TransferState,
    /// Stored frames including repeated ones
    pub frames_received: u16,
    pub bitmap: u64,
    /// Slot and plane of the running transfer, known after the first stored frame
    pub image: Option<ImageId>,
}

pub struct ImageReceiver {
    config: ReceiverConfig,
    state: TransferState,
    assembler: FrameAssembler,
    bitmap: u64,
    frames_received: u16,
    image: Option<ImageId>,
    idle_polls: u32,
}

impl Default for ImageReceiver {
    fn default() -> Self {
        Self::new(ReceiverConfig::default())
    }
}

impl ImageReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            state: TransferState::Idle,
            assembler: FrameAssembler::new(),
            bitmap: 0,
            frames_received: 0,
            image: None,
            idle_polls: 0,
        }
    }

    /// Drops the running transfer and any partially received frame.
    pub fn reset(&mut self) {
        self.state = TransferState::Idle;
        self.assembler.reset();
        self.bitmap = 0;
        self.frames_received = 0;
        self.image = None;
        self.idle_polls = 0;
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            state: self.state,
            frames_received: self.frames_received,
            bitmap: self.bitmap,
            image: self.image,
        }
    }

    /// Processes every byte waiting in `rx` and returns how many there were. A poll without any
    /// byte counts towards the idle timeout.
    pub fn poll<T: Platform, W: Write, const N: usize>(
        &mut self,
        rx: &mut Consumer<'_, u8, N>,
        store: &mut FlashStore<T>,
        tx: &mut W,
    ) -> usize {
        let mut received = 0;
        while let Some(byte) = rx.dequeue() {
            self.feed(byte, store, tx);
            received += 1;
        }

        if received == 0 {
            self.idle_polls = self.idle_polls.saturating_add(1);
            if self.idle_polls > self.config.idle_timeout_polls
                && (self.state != TransferState::Idle || self.assembler.in_frame())
            {
                self.reset();
            }
        }

        received
    }

    /// Processes a single received byte.
    pub fn feed<T: Platform, W: Write>(&mut self, byte: u8, store: &mut FlashStore<T>, tx: &mut W) {
        self.idle_polls = 0;

        match self.assembler.push(byte) {
            None => {}
            Some(FrameEvent::Control(raw)) => match parse_control(&raw) {
                Some(command) => self.on_command(command, store, tx),
                None => {
                    #[cfg(feature = "defmt")]
                    trace!("receiver: dropping control frame {:x}", raw);
                }
            },
            Some(FrameEvent::Data(raw)) => self.on_data(&raw, store, tx),
            Some(FrameEvent::Malformed { frame_num }) => {
                #[cfg(feature = "defmt")]
                warn!("receiver: frame {} not terminated", frame_num);

                respond_frame(tx, Response::NakInvalidFrame, frame_num);
            }
            Some(FrameEvent::Overflow { frame_num }) => {
                #[cfg(feature = "defmt")]
                warn!("receiver: buffer overflow, frame {}", frame_num);

                respond_frame(tx, Response::NakBufferOverflow, frame_num);
            }
        }
    }

    fn on_command<T: Platform, W: Write>(
        &mut self,
        command: Command,
        store: &mut FlashStore<T>,
        tx: &mut W,
    ) {
        match (command, self.state) {
            (Command::Start, TransferState::Idle | TransferState::Complete) => {
                #[cfg(feature = "defmt")]
                debug!("receiver: transfer started");

                #[cfg(feature = "debug-logs")]
                println!("  receiver: start");

                self.reset();
                self.state = TransferState::WaitingData;
                respond(tx, Response::Ready);
            }
            (Command::End, TransferState::WaitingData) => self.finish(store, tx),
            (_command, _state) => {
                #[cfg(feature = "defmt")]
                warn!("receiver: {} rejected in state {}", _command, _state);

                respond(tx, Response::Fail);
            }
        }
    }

    fn finish<T: Platform, W: Write>(&mut self, store: &mut FlashStore<T>, tx: &mut W) {
        self.state = TransferState::VerifyComplete;

        let image = match self.image {
            Some(image) if self.bitmap == FULL_BITMAP => image,
            _ => {
                #[cfg(feature = "defmt")]
                warn!(
                    "receiver: incomplete, missing {=u64:#x}",
                    !self.bitmap & FULL_BITMAP
                );

                #[cfg(feature = "debug-logs")]
                println!(
                    "  receiver: incomplete, missing {:#018x}",
                    !self.bitmap & FULL_BITMAP
                );

                self.reset();
                respond(tx, Response::Fail);
                return;
            }
        };

        match image::write_image_header(store, image) {
            Ok(_) => {
                #[cfg(feature = "defmt")]
                debug!("receiver: {} complete", image);

                #[cfg(feature = "debug-logs")]
                println!("  receiver: {image:?} complete");

                self.state = TransferState::Complete;
                respond(tx, Response::Complete);
            }
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("receiver: writing image header failed: {}", _e);

                self.reset();
                respond(tx, Response::Fail);
            }
        }
    }

    /// Checks are applied in order: state, checksum, crc, frame number, slot. Only the offending
    /// frame is rejected, the transfer itself goes on.
    fn on_data<T: Platform, W: Write>(
        &mut self,
        raw: &[u8; DATA_FRAME_LEN],
        store: &mut FlashStore<T>,
        tx: &mut W,
    ) {
        let frame_num = frame_num_of(raw);

        if self.state != TransferState::WaitingData {
            #[cfg(feature = "defmt")]
            warn!("receiver: frame {} in state {}", frame_num, self.state);

            return respond_frame(tx, Response::NakStateMismatch, frame_num);
        }

        if !DataFrame::checksum_valid(raw) {
            #[cfg(feature = "defmt")]
            warn!("receiver: frame {} checksum mismatch", frame_num);

            return respond_frame(tx, Response::NakChecksum, frame_num);
        }

        let frame = DataFrame::decode(raw);
        if !frame.crc_valid::<T>() {
            #[cfg(feature = "defmt")]
            warn!("receiver: frame {} crc mismatch", frame_num);

            return respond_frame(tx, Response::NakCrc, frame_num);
        }

        if frame_num > MAX_FRAME_NUM {
            #[cfg(feature = "defmt")]
            warn!("receiver: frame {} out of range", frame_num);

            return respond_frame(tx, Response::NakInvalidFrame, frame_num);
        }

        let Some(image) = ImageId::from_tag(frame.slot) else {
            #[cfg(feature = "defmt")]
            warn!("receiver: frame {} invalid slot {:#04x}", frame_num, frame.slot);

            return respond_frame(tx, Response::NakInvalidFrame, frame_num);
        };

        if self.image.is_some_and(|current| current != image) {
            #[cfg(feature = "defmt")]
            warn!("receiver: frame {} for {}, expected {}", frame_num, image, self.image);

            return respond_frame(tx, Response::NakStateMismatch, frame_num);
        }

        match store.write(image.data_id(frame_num), &frame.payload) {
            Ok(()) => {
                self.image = Some(image);
                self.bitmap |= 1 << frame_num;
                self.frames_received = self.frames_received.saturating_add(1);

                #[cfg(feature = "defmt")]
                trace!(
                    "receiver: frame {} stored, bitmap {=u64:#x}",
                    frame_num, self.bitmap
                );

                respond_frame(tx, Response::Ack, frame_num);
            }
            Err(_e) => {
                #[cfg(feature = "defmt")]
                warn!("receiver: frame {} write failed: {}", frame_num, _e);

                respond_frame(tx, Response::NakFlashWriteFail, frame_num);
            }
        }
    }
}

fn respond<W: Write>(tx: &mut W, response: Response) {
    tx.write_all(&response.control_frame()).ok();
    tx.flush().ok();
}

fn respond_frame<W: Write>(tx: &mut W, response: Response, frame_num: u16) {
    tx.write_all(&response.frame_response(frame_num)).ok();
    tx.flush().ok();
}
