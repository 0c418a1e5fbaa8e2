/* Freedom Scientific driver: Focus and PAC Mate series. */
/*  */
/* Four-byte packet header plus an optional checksummed payload. Every  */
/* host-to-unit packet is acknowledged; writes run a single-outstanding */
/* request window whose payload limit adapts to timeout NAKs. */

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Capabilities, Geometry, ProtocolDriver, flush_input};
use crate::cells::{DotsTable, OutputTable};
use crate::command::*;
use crate::device_spec::TransportKind;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity, UsbDeviceId};

const SERIAL_CONFIG: SerialConfig = SerialConfig::new(57600, SerialParity::None);

const USB_IDS: &[UsbDeviceId] = &[
    UsbDeviceId { vendor: 0x0F4E, product: 0x0100 }, /* Focus */
    UsbDeviceId { vendor: 0x0F4E, product: 0x0111 }, /* PAC Mate */
    UsbDeviceId { vendor: 0x0F4E, product: 0x0112 }, /* Focus 2 */
];

/* Packet types */
const PKT_QUERY: u8 = 0x00; /* host->unit: request device information */
const PKT_ACK: u8 = 0x01; /* unit->host: acknowledge packet receipt */
const PKT_NAK: u8 = 0x02; /* unit->host: negative acknowledge */
const PKT_KEY: u8 = 0x03; /* unit->host: key event */
const PKT_BUTTON: u8 = 0x04; /* unit->host: routing button event */
const PKT_WHEEL: u8 = 0x05; /* unit->host: whiz wheel event */
const PKT_HVADJ: u8 = 0x08; /* host->unit: set braille dot firmness */
const PKT_INFO: u8 = 0x80; /* unit->host: response to query packet */
const PKT_WRITE: u8 = 0x81; /* host->unit: write to braille display */

/* NAK reason codes */
const PKT_ERR_TIMEOUT: u8 = 0x30; /* no data received from host for a while */
const PKT_ERR_CHECKSUM: u8 = 0x31; /* incorrect checksum */
const PKT_ERR_TYPE: u8 = 0x32; /* unsupported packet type */
const PKT_ERR_PARAMETER: u8 = 0x33; /* invalid parameter */
const PKT_ERR_SIZE: u8 = 0x34; /* write size too large */
const PKT_ERR_POSITION: u8 = 0x35; /* write position too large */
const PKT_ERR_OVERRUN: u8 = 0x36; /* message queue overflow */
const PKT_ERR_POWER: u8 = 0x37; /* insufficient USB power */
const PKT_ERR_SPI: u8 = 0x38; /* timeout on SPI bus */

const PACKET_HEADER_SIZE: usize = 4;
const MAXIMUM_PAYLOAD: usize = 0x100;

/* Function key bits assembled from PKT_KEY and the virtual hot-key row. */
const KEY_DOT1: u32 = 0x0000_0001;
const KEY_DOT2: u32 = 0x0000_0002;
const KEY_DOT3: u32 = 0x0000_0004;
const KEY_DOT4: u32 = 0x0000_0008;
const KEY_DOT5: u32 = 0x0000_0010;
const KEY_DOT6: u32 = 0x0000_0020;
const KEY_DOT7: u32 = 0x0000_0040;
const KEY_DOT8: u32 = 0x0000_0080;
const KEY_WHEEL_LEFT: u32 = 0x0000_0100;
const KEY_WHEEL_RIGHT: u32 = 0x0000_0200;
const KEY_SHIFT_LEFT: u32 = 0x0000_0400;
const KEY_SHIFT_RIGHT: u32 = 0x0000_0800;
const KEY_ADVANCE_LEFT: u32 = 0x0000_1000;
const KEY_ADVANCE_RIGHT: u32 = 0x0000_2000;
const KEY_SPACE: u32 = 0x0000_8000;
const KEY_GDF_LEFT: u32 = 0x0001_0000;
const KEY_GDF_RIGHT: u32 = 0x0002_0000;
const KEY_HOT1: u32 = 0x0100_0000;
const KEY_HOT2: u32 = 0x0200_0000;
const KEY_HOT3: u32 = 0x0400_0000;
const KEY_HOT4: u32 = 0x0800_0000;
const KEY_HOT5: u32 = 0x1000_0000;
const KEY_HOT6: u32 = 0x2000_0000;
const KEY_HOT7: u32 = 0x4000_0000;
const KEY_HOT8: u32 = 0x8000_0000;

const DOT_KEYS: u32 = KEY_DOT1
    | KEY_DOT2
    | KEY_DOT3
    | KEY_DOT4
    | KEY_DOT5
    | KEY_DOT6
    | KEY_DOT7
    | KEY_DOT8;
const SHIFT_KEYS: u32 = KEY_SHIFT_LEFT | KEY_SHIFT_RIGHT;

/* Whiz wheel event encoding. */
const WHEEL_COUNT: u8 = 0x07;
const WHEEL_DOWN: u8 = 0x08;
const WHEEL_UNIT: u8 = 0x30;
const WHEEL_LEFT: u8 = 0x00;
const WHEEL_RIGHT: u8 = 0x10;

const ACK_TIMEOUT_MS: u64 = 500;
const MAXIMUM_MISSING_ACKS: u8 = 5;

const DOTS_12345678: DotsTable = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80];
const DOTS_12374568: DotsTable = [0x01, 0x02, 0x04, 0x10, 0x20, 0x40, 0x08, 0x80];

#[derive(Clone, Copy)]
struct ModelEntry {
    identifier: &'static str,
    dots: &'static DotsTable,
    total_cells: usize,
    status_cells: usize,
    hotkeys_row: Option<u8>,
}

const MODEL_TABLE: &[ModelEntry] = &[
    ModelEntry { identifier: "Focus 40", dots: &DOTS_12345678, total_cells: 40, status_cells: 0, hotkeys_row: None },
    ModelEntry { identifier: "Focus 44", dots: &DOTS_12374568, total_cells: 44, status_cells: 3, hotkeys_row: None },
    ModelEntry { identifier: "Focus 70", dots: &DOTS_12374568, total_cells: 70, status_cells: 3, hotkeys_row: None },
    ModelEntry { identifier: "Focus 80", dots: &DOTS_12345678, total_cells: 80, status_cells: 0, hotkeys_row: None },
    ModelEntry { identifier: "Focus 84", dots: &DOTS_12374568, total_cells: 84, status_cells: 3, hotkeys_row: None },
    ModelEntry { identifier: "pm display 20", dots: &DOTS_12345678, total_cells: 20, status_cells: 0, hotkeys_row: Some(1) },
    ModelEntry { identifier: "pm display 40", dots: &DOTS_12345678, total_cells: 40, status_cells: 0, hotkeys_row: Some(1) },
    ModelEntry { identifier: "pm display 80", dots: &DOTS_12345678, total_cells: 80, status_cells: 0, hotkeys_row: Some(1) },
];

/* One parsed unit-to-host packet. */
#[derive(Debug, Clone)]
struct Packet {
    header: [u8; 4],
    payload: Vec<u8>,
}

impl Packet {
    fn kind(&self) -> u8 {
        self.header[0]
    }
}

/* Which host packet is awaiting its acknowledgement. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckPending {
    Write,
    Firmness,
}

pub struct FreedomScientificDriver {
    debug_packets: bool,

    identifier: String,
    dots: &'static DotsTable,
    total_cells: usize,
    hotkeys_row: Option<u8>,
    output_table: OutputTable,

    text_offset: usize,
    text_cells: usize,
    status_offset: usize,
    status_cells: usize,
    output_buffer: Vec<u8>,

    /* Dirty range awaiting transmission; a request in flight covers
     * writing_from..=writing_to until its acknowledgement resolves. */
    write_from: Option<usize>,
    write_to: Option<usize>,
    writing_from: usize,
    writing_to: usize,
    output_payload_limit: usize,

    firmness_setting: Option<u8>,

    input: Vec<u8>,
    acknowledgement: Option<AckPending>,
    acknowledgement_time: Instant,
    acknowledgements_missing: u8,

    real_keys: u32,
    virtual_keys: u32,
    pressed_keys: u32,
    active_keys: u32,
    wheel_command: i32,
    wheel_counter: u8,
}

impl FreedomScientificDriver {
    pub fn new() -> Self {
        Self {
            debug_packets: false,
            identifier: String::new(),
            dots: &DOTS_12345678,
            total_cells: 0,
            hotkeys_row: None,
            output_table: OutputTable::build(&DOTS_12345678),
            text_offset: 0,
            text_cells: 0,
            status_offset: 0,
            status_cells: 0,
            output_buffer: Vec::new(),
            write_from: None,
            write_to: None,
            writing_from: 0,
            writing_to: 0,
            output_payload_limit: 0xFF,
            firmness_setting: None,
            input: Vec::new(),
            acknowledgement: None,
            acknowledgement_time: Instant::now(),
            acknowledgements_missing: 0,
            real_keys: 0,
            virtual_keys: 0,
            pressed_keys: 0,
            active_keys: 0,
            wheel_command: CMD_NOOP,
            wheel_counter: 0,
        }
    }

    async fn send_packet(
        &mut self,
        port: &mut Port,
        kind: u8,
        arg1: u8,
        arg2: u8,
        arg3: u8,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + MAXIMUM_PAYLOAD + 1);
        packet.extend_from_slice(&[kind, arg1, arg2, arg3]);

        if let Some(data) = data {
            let length = usize::from(arg1);
            packet.extend_from_slice(&data[..length]);
            let checksum = packet
                .iter()
                .fold(0u8, |checksum, byte| checksum.wrapping_sub(*byte));
            packet.push(checksum);
        }

        if self.debug_packets {
            debug!("Output Packet: {:02x?}", packet);
        }
        port.write_bytes(&packet).await?;
        port.credit_write_delay(packet.len());
        Ok(())
    }

    fn log_negative_acknowledgement(packet: &Packet) {
        let problem = match packet.header[1] {
            PKT_ERR_TIMEOUT => "timeout during packet transmission",
            PKT_ERR_CHECKSUM => "incorrect checksum",
            PKT_ERR_TYPE => "unknown packet type",
            PKT_ERR_PARAMETER => "invalid parameter value",
            PKT_ERR_SIZE => "write size too large",
            PKT_ERR_POSITION => "write start too large",
            PKT_ERR_OVERRUN => "message FIFO overflow",
            PKT_ERR_POWER => "insufficient USB power",
            PKT_ERR_SPI => "SPI bus timeout",
            _ => "unknown problem",
        };
        warn!(
            "Negative Acknowledgement: [{:02X}] {} in component {:02X}",
            packet.header[1], problem, packet.header[2]
        );
    }

    fn set_acknowledgement(&mut self, pending: AckPending) {
        self.acknowledgement = Some(pending);
        self.acknowledgement_time = Instant::now();
    }

    fn handle_acknowledgement(&mut self, ok: bool) {
        match self.acknowledgement.take() {
            Some(AckPending::Firmness) => {
                self.firmness_setting = None;
            }
            Some(AckPending::Write) => {
                if !ok {
                    /* Merge the in-flight range back into the dirty one
                     * so the next request re-sends it. */
                    self.write_from = Some(match self.write_from {
                        Some(from) => from.min(self.writing_from),
                        None => self.writing_from,
                    });
                    self.write_to = Some(match self.write_to {
                        Some(to) => to.max(self.writing_to),
                        None => self.writing_to,
                    });
                }
            }
            None => {}
        }
    }

    /* Issue the next host packet if nothing is outstanding. Firmness
     * changes jump the queue ahead of cell writes. */
    async fn write_request(&mut self, port: &mut Port) -> Result<()> {
        if self.acknowledgement.is_some() {
            return Ok(());
        }

        if let Some(setting) = self.firmness_setting {
            self.send_packet(port, PKT_HVADJ, setting, 0, 0, None).await?;
            self.set_acknowledgement(AckPending::Firmness);
            return Ok(());
        }

        if let (Some(from), Some(to)) = (self.write_from, self.write_to) {
            let mut count = to + 1 - from;
            let truncated = count > self.output_payload_limit;
            if truncated {
                count = self.output_payload_limit;
            }
            let data: Vec<u8> = self.output_buffer[from..from + count].to_vec();
            self.send_packet(port, PKT_WRITE, count as u8, from as u8, 0, Some(&data))
                .await?;
            self.set_acknowledgement(AckPending::Write);
            self.writing_from = from;
            if truncated {
                let next = from + count;
                self.write_from = Some(next);
                self.writing_to = next - 1;
            } else {
                self.writing_to = to;
                self.write_from = None;
                self.write_to = None;
            }
        }
        Ok(())
    }

    fn update_cells(&mut self, cells: &[u8], count: usize, offset: usize) {
        for index in 0..count.min(cells.len()) {
            let cell = self.output_table.translate(cells[index]);
            let position = offset + index;
            if self.output_buffer[position] != cell {
                self.output_buffer[position] = cell;
                self.write_from = Some(self.write_from.map_or(position, |f| f.min(position)));
                self.write_to = Some(self.write_to.map_or(position, |t| t.max(position)));
            }
        }
    }

    /* Reassemble one packet from the byte stream. Leading garbage is
     * skipped until a plausible packet type comes along. */
    async fn read_packet_raw(&mut self, port: &mut Port) -> Result<Option<Packet>> {
        loop {
            let mut size = PACKET_HEADER_SIZE;
            let mut has_payload = false;
            if self.input.len() >= PACKET_HEADER_SIZE && self.input[0] & 0x80 != 0 {
                has_payload = true;
                size += usize::from(self.input[1]) + 1;
            }

            if self.input.len() >= PACKET_HEADER_SIZE && self.input.len() >= size {
                if self.debug_packets {
                    debug!("Input Packet: {:02x?}", &self.input[..size]);
                }
                if has_payload {
                    let checksum = self.input[..size]
                        .iter()
                        .fold(0u8, |checksum, byte| checksum.wrapping_sub(*byte));
                    if checksum != 0 {
                        warn!("Input packet checksum error.");
                    }
                }
                let mut header = [0u8; 4];
                header.copy_from_slice(&self.input[..4]);
                let payload_end = if has_payload { size - 1 } else { size };
                let payload = self.input[PACKET_HEADER_SIZE..payload_end].to_vec();
                self.input.drain(..size);
                return Ok(Some(Packet { header, payload }));
            }

            let want = size - self.input.len();
            let mut buf = vec![0u8; want];
            let count = port.read_bytes(&mut buf, false).await?;
            if count == 0 {
                if !self.input.is_empty() {
                    if port.await_input(std::time::Duration::from_millis(1000)).await? {
                        continue;
                    }
                    warn!("Aborted Input: {:02x?}", self.input);
                    self.input.clear();
                }
                return Ok(None);
            }
            self.acknowledgements_missing = 0;
            buf.truncate(count);

            if self.input.is_empty() {
                const PACKET_STARTS: [u8; 6] =
                    [PKT_ACK, PKT_NAK, PKT_KEY, PKT_BUTTON, PKT_WHEEL, PKT_INFO];
                let first = buf
                    .iter()
                    .position(|byte| PACKET_STARTS.contains(byte))
                    .unwrap_or(buf.len());
                if first > 0 {
                    debug!("Discarded Input: {:02x?}", &buf[..first]);
                    buf.drain(..first);
                }
            }
            self.input.extend_from_slice(&buf);
        }
    }

    /* Like read_packet_raw but consumes acknowledgements, including the
     * implicit NAK when one fails to arrive in time. */
    async fn get_packet(&mut self, port: &mut Port) -> Result<Option<Packet>> {
        loop {
            match self.read_packet_raw(port).await? {
                Some(packet) => match packet.kind() {
                    PKT_NAK => {
                        Self::log_negative_acknowledgement(&packet);
                        if self.acknowledgement.is_none() {
                            warn!("Unexpected NAK.");
                            continue;
                        }
                        if packet.header[1] == PKT_ERR_TIMEOUT {
                            let original = self.output_payload_limit;
                            self.output_payload_limit =
                                self.output_payload_limit.min(self.total_cells);
                            if self.output_payload_limit > 1 {
                                self.output_payload_limit -= 1;
                            }
                            if self.output_payload_limit != original {
                                warn!(
                                    "Maximum payload length reduced from {} to {}.",
                                    original, self.output_payload_limit
                                );
                            }
                        }
                        self.handle_acknowledgement(false);
                        self.write_request(port).await?;
                        continue;
                    }
                    PKT_ACK => {
                        if self.acknowledgement.is_none() {
                            warn!("Unexpected ACK.");
                            continue;
                        }
                        self.handle_acknowledgement(true);
                        self.write_request(port).await?;
                        continue;
                    }
                    _ => return Ok(Some(packet)),
                },
                None => {
                    if self.acknowledgement.is_some()
                        && self.acknowledgement_time.elapsed().as_millis()
                            > u128::from(ACK_TIMEOUT_MS)
                    {
                        self.acknowledgements_missing += 1;
                        if self.acknowledgements_missing < MAXIMUM_MISSING_ACKS {
                            warn!("Missing ACK; assuming NAK.");
                            self.handle_acknowledgement(false);
                            self.write_request(port).await?;
                            continue;
                        }
                        warn!("Too many missing ACKs.");
                        return Err(BrailleError::Timeout {
                            attempts: MAXIMUM_MISSING_ACKS,
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn select_model(&mut self, info: &[u8]) {
        let model_name = text_field(info, 24, 16);
        let firmware = text_field(info, 40, 8);

        let entry = MODEL_TABLE
            .iter()
            .find(|entry| entry.identifier == model_name);
        match entry {
            Some(entry) => {
                self.identifier = entry.identifier.to_string();
                self.dots = entry.dots;
                self.total_cells = entry.total_cells;
                self.status_cells = entry.status_cells;
                self.hotkeys_row = entry.hotkeys_row;
            }
            None => {
                /* Guess a usable geometry from the model string rather
                 * than failing open. */
                warn!("Detected unknown model: {model_name}");
                self.identifier = format!("Generic {model_name}");
                self.dots = if model_name.starts_with("Focus") {
                    &DOTS_12374568
                } else {
                    &DOTS_12345678
                };
                self.total_cells = model_name
                    .rsplit(' ')
                    .next()
                    .and_then(|word| word.parse().ok())
                    .unwrap_or(20);
                self.status_cells = 0;
                self.hotkeys_row = Some(1);
            }
        }
        self.output_table = OutputTable::build(self.dots);
        info!(
            "Detected {}: cells={}, firmware={}",
            self.identifier, self.total_cells, firmware
        );
    }

    fn apply_status_cells_parameter(&mut self, parameters: &Parameters) {
        self.text_cells = self.total_cells;
        self.text_offset = 0;
        self.status_offset = 0;

        let mut cells = self.status_cells as i32;
        let maximum = (self.text_cells / 2) as i32;
        if let Some(value) = parameters.integer(1, -maximum, maximum) {
            cells = value;
        }

        if cells != 0 {
            if cells < 0 {
                self.status_offset = (self.text_cells as i32 + cells) as usize;
                cells = -cells;
            } else {
                self.text_offset = cells as usize + 1;
            }
            self.text_cells -= cells as usize + 1;
        }
        self.status_cells = cells as usize;
    }

    fn interpret_keys(&mut self) -> i32 {
        let keys = self.real_keys | self.virtual_keys;
        let press = (keys & self.pressed_keys) != keys;
        self.pressed_keys = keys;

        let mut flags = 0;
        let keys = if press {
            self.active_keys = keys;
            flags |= FLG_REPEAT_DELAY;
            keys
        } else {
            let held = self.active_keys;
            self.active_keys = 0;
            if held == 0 {
                return CMD_NOOP;
            }
            held
        };

        /* Braille keyboard: dots plus at most the shifts. */
        if keys & DOT_KEYS != 0 && keys & !(DOT_KEYS | SHIFT_KEYS) == 0 {
            let mut command = BLK_PASSDOTS | flags;
            command |= (keys & DOT_KEYS) as i32;
            if keys & KEY_SHIFT_LEFT != 0 {
                command |= FLG_CHAR_UPPER;
            }
            if keys & KEY_SHIFT_RIGHT != 0 {
                command |= FLG_CHAR_CONTROL;
            }
            return command;
        }

        let command = CHORD_COMMANDS
            .iter()
            .find(|(chord, _)| *chord == keys)
            .map(|(_, command)| *command)
            .unwrap_or(CMD_NOOP);

        if command != CMD_NOOP { command | flags } else { command }
    }

    fn interpret_button(&mut self, button: u8, press: bool, row: u8) -> i32 {
        let mut button = i32::from(button);

        if Some(row) == self.hotkeys_row {
            const HOT_KEYS: [u32; 10] = [
                KEY_GDF_LEFT,
                KEY_HOT1, KEY_HOT2, KEY_HOT3, KEY_HOT4,
                KEY_HOT5, KEY_HOT6, KEY_HOT7, KEY_HOT8,
                KEY_GDF_RIGHT,
            ];
            button -= (self.total_cells as i32 - HOT_KEYS.len() as i32) / 2;
            let key = if button < 0 {
                KEY_ADVANCE_LEFT
            } else if button >= HOT_KEYS.len() as i32 {
                KEY_ADVANCE_RIGHT
            } else {
                HOT_KEYS[button as usize]
            };
            if press {
                self.virtual_keys |= key;
            } else {
                self.virtual_keys &= !key;
            }
            return self.interpret_keys();
        }

        self.active_keys = 0;
        let mut command = CMD_NOOP;
        if press {
            let text_range =
                self.text_offset as i32..(self.text_offset + self.text_cells) as i32;
            if text_range.contains(&button) {
                button -= self.text_offset as i32;
                command = match row {
                    0 => match self.pressed_keys {
                        0 => BLK_ROUTE,
                        KEY_ADVANCE_LEFT => BLK_CUTBEGIN,
                        KEY_ADVANCE_RIGHT => BLK_CUTRECT,
                        KEY_GDF_LEFT => BLK_CUTAPPEND,
                        KEY_GDF_RIGHT => BLK_CUTLINE,
                        KEY_SPACE => BLK_PASSKEY + KEY_FUNCTION,
                        KEY_SHIFT_RIGHT => BLK_SWITCHVT,
                        _ => CMD_NOOP,
                    },
                    1 => match self.pressed_keys {
                        0 => BLK_DESCCHAR,
                        KEY_ADVANCE_LEFT => BLK_PRINDENT,
                        KEY_ADVANCE_RIGHT => BLK_NXINDENT,
                        KEY_GDF_LEFT => BLK_SETLEFT,
                        _ => CMD_NOOP,
                    },
                    _ => CMD_NOOP,
                };
                if command != CMD_NOOP {
                    command += button;
                }
            }
        }
        command
    }

    fn interpret_wheel(&mut self, arg: u8) -> i32 {
        let unit = arg & WHEEL_UNIT;
        let mut motion = arg & (WHEEL_UNIT | WHEEL_DOWN);
        if unit == WHEEL_RIGHT {
            motion ^= WHEEL_DOWN;
        }

        self.active_keys = 0;
        self.wheel_command = match motion {
            WHEEL_LEFT => match self.pressed_keys {
                0 => CMD_LNUP,
                KEY_WHEEL_LEFT => CMD_PRDIFLN,
                KEY_ADVANCE_LEFT => CMD_PRPROMPT,
                KEY_ADVANCE_RIGHT => CMD_PRPGRPH,
                KEY_GDF_LEFT => CMD_ATTRUP,
                KEY_GDF_RIGHT => CMD_PRSEARCH,
                _ => CMD_NOOP,
            },
            motion if motion == WHEEL_LEFT | WHEEL_DOWN => match self.pressed_keys {
                0 => CMD_LNDN,
                KEY_WHEEL_LEFT => CMD_NXDIFLN,
                KEY_ADVANCE_LEFT => CMD_NXPROMPT,
                KEY_ADVANCE_RIGHT => CMD_NXPGRPH,
                KEY_GDF_LEFT => CMD_ATTRDN,
                KEY_GDF_RIGHT => CMD_NXSEARCH,
                _ => CMD_NOOP,
            },
            WHEEL_RIGHT => match self.pressed_keys {
                0 => CMD_FWINLT,
                KEY_WHEEL_RIGHT => CMD_CHRLT,
                _ => CMD_NOOP,
            },
            motion if motion == WHEEL_RIGHT | WHEEL_DOWN => match self.pressed_keys {
                0 => CMD_FWINRT,
                KEY_WHEEL_RIGHT => CMD_CHRRT,
                _ => CMD_NOOP,
            },
            _ => CMD_NOOP,
        };

        if self.wheel_command != CMD_NOOP {
            self.wheel_counter = (arg & WHEEL_COUNT).saturating_sub(1);
        }
        self.wheel_command
    }
}

/* Chords with no routing or wheel involvement. Dot input is handled
 * before this table applies. */
const CHORD_COMMANDS: &[(u32, i32)] = &[
    (KEY_WHEEL_LEFT, CMD_LNBEG),
    (KEY_WHEEL_RIGHT, CMD_LNEND),
    (KEY_GDF_LEFT, CMD_BACK),
    (KEY_GDF_RIGHT, CMD_HOME),
    (KEY_GDF_LEFT | KEY_GDF_RIGHT, CMD_PASTE),
    (KEY_ADVANCE_LEFT, CMD_FWINLT),
    (KEY_ADVANCE_RIGHT, CMD_FWINRT),
    (KEY_GDF_LEFT | KEY_ADVANCE_LEFT, CMD_TOP_LEFT),
    (KEY_GDF_LEFT | KEY_ADVANCE_RIGHT, CMD_BOT_LEFT),
    (KEY_GDF_RIGHT | KEY_ADVANCE_LEFT, CMD_TOP),
    (KEY_GDF_RIGHT | KEY_ADVANCE_RIGHT, CMD_BOT),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT4, CMD_SKPIDLNS),
    (KEY_HOT1, CMD_SKPIDLNS),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2, CMD_SKPBLNKWINS),
    (KEY_GDF_RIGHT | KEY_HOT1, CMD_SKPBLNKWINS),
    (KEY_SPACE | KEY_DOT1, CMD_DISPMD),
    (KEY_HOT2, CMD_DISPMD),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT3 | KEY_DOT6, CMD_ATTRVIS),
    (KEY_GDF_RIGHT | KEY_HOT2, CMD_ATTRVIS),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT3 | KEY_DOT4 | KEY_DOT5, CMD_CSRTRK),
    (KEY_HOT3, CMD_CSRTRK),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT4, CMD_CSRVIS),
    (KEY_GDF_RIGHT | KEY_HOT3, CMD_CSRVIS),
    (KEY_HOT4, CMD_SIXDOTS),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT3 | KEY_DOT5, CMD_SIXDOTS | FLG_TOGGLE_ON),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT3 | KEY_DOT6, CMD_SIXDOTS | FLG_TOGGLE_OFF),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT5, CMD_AUTOREPEAT),
    (KEY_GDF_RIGHT | KEY_HOT4, CMD_AUTOREPEAT),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2 | KEY_DOT5, CMD_HELP),
    (KEY_HOT5, CMD_HELP),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2 | KEY_DOT4, CMD_FREEZE),
    (KEY_GDF_RIGHT | KEY_HOT5, CMD_FREEZE),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2 | KEY_DOT3, CMD_LEARN),
    (KEY_HOT6, CMD_LEARN),
    (KEY_SPACE | KEY_SHIFT_LEFT | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT4, CMD_PREFLOAD),
    (KEY_GDF_RIGHT | KEY_HOT6, CMD_PREFLOAD),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT4, CMD_PREFMENU),
    (KEY_HOT7, CMD_PREFMENU),
    (KEY_SPACE | KEY_SHIFT_RIGHT | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT4, CMD_PREFSAVE),
    (KEY_GDF_RIGHT | KEY_HOT7, CMD_PREFSAVE),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT3 | KEY_DOT4, CMD_INFO),
    (KEY_HOT8, CMD_INFO),
    (KEY_SPACE | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT6, CMD_CSRJMP_VERT),
    (KEY_GDF_RIGHT | KEY_HOT8, CMD_CSRJMP_VERT),
    (KEY_SPACE, BLK_PASSDOTS),
    (KEY_SPACE | KEY_SHIFT_LEFT, BLK_PASSKEY + KEY_BACKSPACE),
    (KEY_SPACE | KEY_SHIFT_RIGHT, BLK_PASSKEY + KEY_ENTER),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT3 | KEY_DOT5 | KEY_DOT6, BLK_PASSKEY + KEY_TAB),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT3, BLK_PASSKEY + KEY_CURSOR_LEFT),
    (KEY_SPACE | KEY_DOT5 | KEY_DOT6, BLK_PASSKEY + KEY_CURSOR_RIGHT),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT5, BLK_PASSKEY + KEY_CURSOR_UP),
    (KEY_SPACE | KEY_DOT3 | KEY_DOT6, BLK_PASSKEY + KEY_CURSOR_DOWN),
    (KEY_SPACE | KEY_DOT5, BLK_PASSKEY + KEY_PAGE_UP),
    (KEY_SPACE | KEY_DOT6, BLK_PASSKEY + KEY_PAGE_DOWN),
    (KEY_SPACE | KEY_DOT2, BLK_PASSKEY + KEY_HOME),
    (KEY_SPACE | KEY_DOT3, BLK_PASSKEY + KEY_END),
    (KEY_SPACE | KEY_DOT3 | KEY_DOT5, BLK_PASSKEY + KEY_INSERT),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT5 | KEY_DOT6, BLK_PASSKEY + KEY_DELETE),
    (KEY_SPACE | KEY_DOT2 | KEY_DOT6, BLK_PASSKEY + KEY_ESCAPE),
    (KEY_SPACE | KEY_SHIFT_LEFT | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT6, CMD_SWITCHVT_PREV),
    (KEY_SPACE | KEY_SHIFT_RIGHT | KEY_DOT1 | KEY_DOT2 | KEY_DOT3 | KEY_DOT6, CMD_SWITCHVT_NEXT),
];

fn text_field(bytes: &[u8], offset: usize, length: usize) -> String {
    let end = (offset + length).min(bytes.len());
    let field = &bytes[offset.min(end)..end];
    let trimmed = field
        .iter()
        .position(|byte| *byte == 0)
        .map_or(field, |nul| &field[..nul]);
    String::from_utf8_lossy(trimmed).trim_end().to_string()
}

#[async_trait]
impl ProtocolDriver for FreedomScientificDriver {
    fn name(&self) -> &'static str {
        "Freedom Scientific"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["debugpackets", "statuscells"]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            packet_io: true,
            firmness: true,
            ..Capabilities::default()
        }
    }

    fn supported_transports(&self) -> &'static [TransportKind] {
        &[TransportKind::Serial, TransportKind::Usb]
    }

    fn usb_ids(&self) -> &'static [UsbDeviceId] {
        USB_IDS
    }

    async fn open(&mut self, port: &mut Port, parameters: &Parameters) -> Result<Geometry> {
        self.debug_packets = parameters.yes_no(0, false);
        self.input.clear();
        self.output_payload_limit = 0xFF;
        port.configure_serial(&SERIAL_CONFIG).await?;

        /* Drain stale input before the first query. */
        while port.await_input(std::time::Duration::from_millis(10)).await? {
            if self.read_packet_raw(port).await?.is_none() {
                break;
            }
        }

        for _ in 0..3 {
            self.send_packet(port, PKT_QUERY, 0, 0, 0, None).await?;

            let mut acknowledged = false;
            let mut identified = false;
            while port.await_input(std::time::Duration::from_millis(100)).await? {
                let Some(packet) = self.read_packet_raw(port).await? else {
                    continue;
                };
                match packet.kind() {
                    PKT_INFO => {
                        self.select_model(&packet.payload);
                        self.apply_status_cells_parameter(parameters);
                        self.output_buffer = vec![0; self.total_cells];
                        self.write_from = Some(0);
                        self.write_to = Some(self.total_cells - 1);
                        self.acknowledgement = None;
                        self.acknowledgements_missing = 0;
                        self.firmness_setting = None;
                        self.real_keys = 0;
                        self.virtual_keys = 0;
                        self.pressed_keys = 0;
                        self.active_keys = 0;
                        self.wheel_counter = 0;
                        identified = true;
                    }
                    PKT_ACK => acknowledged = true,
                    PKT_NAK => {
                        Self::log_negative_acknowledgement(&packet);
                        acknowledged = false;
                        identified = false;
                    }
                    _ => {}
                }
                if acknowledged && identified {
                    return Ok(self.geometry());
                }
            }
        }

        Err(BrailleError::ProbeFailed { driver: self.name() })
    }

    async fn close(&mut self, port: &mut Port) {
        /* Let a pending acknowledgement resolve before dropping the
         * transport. */
        while let Ok(true) = port.await_input(std::time::Duration::from_millis(100)).await {
            if self.get_packet(port).await.is_err() {
                break;
            }
        }
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.text_cells, self.status_cells)
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        self.update_cells(cells, self.text_cells, self.text_offset);
        self.write_request(port).await
    }

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let _ = port;
        self.update_cells(cells, self.status_cells, self.status_offset);
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        _context: CommandContext,
    ) -> Result<ReadResult> {
        if self.wheel_counter > 0 {
            self.wheel_counter -= 1;
            return Ok(ReadResult::Command(self.wheel_command));
        }

        loop {
            let Some(packet) = self.get_packet(port).await? else {
                return Ok(ReadResult::None);
            };
            match packet.kind() {
                PKT_KEY => {
                    self.real_keys = u32::from(packet.header[1])
                        | u32::from(packet.header[2]) << 8
                        | u32::from(packet.header[3]) << 16;
                    return Ok(ReadResult::Command(self.interpret_keys()));
                }
                PKT_BUTTON => {
                    let button = packet.header[1];
                    let press = packet.header[2] & 0x01 != 0;
                    let row = packet.header[3];
                    return Ok(ReadResult::Command(self.interpret_button(button, press, row)));
                }
                PKT_WHEEL => {
                    return Ok(ReadResult::Command(self.interpret_wheel(packet.header[1])));
                }
                _ => {
                    warn!(
                        "Unsupported packet: {:02X} {:02X} {:02X} {:02X}",
                        packet.header[0], packet.header[1], packet.header[2], packet.header[3]
                    );
                    continue;
                }
            }
        }
    }

    async fn read_packet(&mut self, port: &mut Port, buf: &mut [u8]) -> Result<usize> {
        let Some(packet) = self.read_packet_raw(port).await? else {
            return Ok(0);
        };
        let size = PACKET_HEADER_SIZE + packet.payload.len();
        if buf.len() < size {
            return Err(BrailleError::BufferTooSmall {
                expected: size,
                actual: buf.len(),
            });
        }
        buf[..PACKET_HEADER_SIZE].copy_from_slice(&packet.header);
        buf[PACKET_HEADER_SIZE..size].copy_from_slice(&packet.payload);
        Ok(size)
    }

    async fn write_packet(&mut self, port: &mut Port, packet: &[u8]) -> Result<usize> {
        if packet.len() < PACKET_HEADER_SIZE {
            return Err(BrailleError::BufferTooSmall {
                expected: PACKET_HEADER_SIZE,
                actual: packet.len(),
            });
        }
        let has_payload = packet[0] & 0x80 != 0;
        let size = if has_payload {
            PACKET_HEADER_SIZE + usize::from(packet[1])
        } else {
            PACKET_HEADER_SIZE
        };
        if packet.len() < size {
            return Err(BrailleError::BufferTooSmall {
                expected: size,
                actual: packet.len(),
            });
        }
        let payload = has_payload.then(|| packet[PACKET_HEADER_SIZE..size].to_vec());
        self.send_packet(
            port,
            packet[0],
            packet[1],
            packet[2],
            packet[3],
            payload.as_deref(),
        )
        .await?;
        Ok(size)
    }

    async fn reset(&mut self, port: &mut Port) -> Result<()> {
        flush_input(port).await
    }

    async fn set_firmness(&mut self, port: &mut Port, setting: u8) -> Result<()> {
        self.firmness_setting = Some(setting);
        self.write_request(port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ReadResult;

    fn info_packet(model: &str) -> Vec<u8> {
        let mut payload = vec![0u8; 48];
        payload[..12].copy_from_slice(b"FreedomSci. ");
        payload[24..24 + model.len()].copy_from_slice(model.as_bytes());
        payload[40..44].copy_from_slice(b"1.25");

        let mut packet = vec![PKT_INFO, payload.len() as u8, 0, 0];
        packet.extend_from_slice(&payload);
        let checksum = packet
            .iter()
            .fold(0u8, |checksum, byte| checksum.wrapping_sub(*byte));
        packet.push(checksum);
        packet
    }

    async fn open_focus_40() -> (FreedomScientificDriver, Port) {
        let mut driver = FreedomScientificDriver::new();
        let mut port = Port::mock();
        let mut reply = info_packet("Focus 40");
        reply.extend_from_slice(&[PKT_ACK, 0, 0, 0]);
        port.mock_mut().reply_on_write(&[PKT_QUERY, 0, 0, 0], &reply);
        let geometry = driver
            .open(&mut port, &Parameters::new(driver.parameter_names(), &[]))
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 40);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_identifies_model() {
        let (driver, _port) = open_focus_40().await;
        assert_eq!(driver.identifier, "Focus 40");
        assert_eq!(driver.total_cells, 40);
    }

    #[tokio::test]
    async fn test_first_write_covers_all_cells() {
        let (mut driver, mut port) = open_focus_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        let output = port.mock_mut().take_output();
        /* header + 40 payload bytes + checksum */
        assert_eq!(output.len(), 4 + 40 + 1);
        assert_eq!(output[0], PKT_WRITE);
        assert_eq!(output[1], 40);
        assert_eq!(output[2], 0);
    }

    #[tokio::test]
    async fn test_single_outstanding_write() {
        let (mut driver, mut port) = open_focus_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().take_output();

        /* No ACK yet: a new dirty range must not produce wire bytes. */
        driver.write_window(&mut port, &[1u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());

        /* The ACK releases the queued range. */
        port.mock_mut().push_input(&[PKT_ACK, 0, 0, 0]);
        assert_eq!(
            driver.read_command(&mut port, CommandContext::Screen).await.unwrap(),
            ReadResult::None
        );
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], PKT_WRITE);
        assert_eq!(output[1], 40);
    }

    #[tokio::test]
    async fn test_timeout_nak_shrinks_payload_limit() {
        let (mut driver, mut port) = open_focus_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().take_output();

        port.mock_mut().push_input(&[PKT_NAK, PKT_ERR_TIMEOUT, 0, 0]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();

        /* Clamped to the cell count, then decremented. */
        assert_eq!(driver.output_payload_limit, 39);

        /* The failed range was restored and re-sent immediately. */
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], PKT_WRITE);
        assert_eq!(output[1], 39);
    }

    #[tokio::test]
    async fn test_diff_limited_to_changed_cell() {
        let (mut driver, mut port) = open_focus_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().push_input(&[PKT_ACK, 0, 0, 0]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        port.mock_mut().take_output();

        let mut cells = [0u8; 40];
        cells[20] = 0xFF;
        driver.write_window(&mut port, &cells).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], PKT_WRITE);
        assert_eq!(output[1], 1);
        assert_eq!(output[2], 20);
        assert_eq!(output[4], 0xFF);
    }

    #[tokio::test]
    async fn test_unchanged_window_writes_nothing() {
        let (mut driver, mut port) = open_focus_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().push_input(&[PKT_ACK, 0, 0, 0]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        port.mock_mut().take_output();

        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mutation_detected() {
        let packet = info_packet("Focus 40");
        let total: u8 = packet.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
        assert_eq!(total, 0);
        for index in 0..packet.len() - 1 {
            let mut mutated = packet.clone();
            mutated[index] ^= 0x40;
            let total: u8 = mutated.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
            assert_ne!(total, 0, "mutation at {index} went undetected");
        }
    }

    #[tokio::test]
    async fn test_key_chord_emits_on_release() {
        let (mut driver, mut port) = open_focus_40().await;

        /* Advance-left press: movement commands emit immediately with
         * the repeat-delay flag. */
        port.mock_mut().push_input(&[PKT_KEY, 0x00, 0x10, 0x00]);
        let result = driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        assert_eq!(result, ReadResult::Command(CMD_FWINLT | FLG_REPEAT_DELAY));

        /* Release produces the same chord without the flag. */
        port.mock_mut().push_input(&[PKT_KEY, 0x00, 0x00, 0x00]);
        let result = driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        assert_eq!(result, ReadResult::Command(CMD_FWINLT));

        /* A second release cycle emits nothing. */
        port.mock_mut().push_input(&[PKT_KEY, 0x00, 0x00, 0x00]);
        let result = driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));
    }

    #[tokio::test]
    async fn test_routing_button_routes() {
        let (mut driver, mut port) = open_focus_40().await;
        port.mock_mut().push_input(&[PKT_BUTTON, 7, 0x01, 0x00]);
        let result = driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 7));
    }

    #[tokio::test]
    async fn test_wheel_repeats_drain_one_per_call() {
        let (mut driver, mut port) = open_focus_40().await;
        /* Left wheel up, count 3. */
        port.mock_mut().push_input(&[PKT_WHEEL, 0x03, 0x00, 0x00]);
        for _ in 0..3 {
            let result = driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
            assert_eq!(result, ReadResult::Command(CMD_LNUP));
        }
        let result = driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        assert_eq!(result, ReadResult::None);
    }

    #[tokio::test]
    async fn test_firmness_waits_for_ack_slot() {
        let (mut driver, mut port) = open_focus_40().await;
        driver.set_firmness(&mut port, 0x80).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], PKT_HVADJ);
        assert_eq!(output[1], 0x80);

        /* Until the ACK arrives nothing else goes out. */
        driver.write_window(&mut port, &[1u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());
    }
}
