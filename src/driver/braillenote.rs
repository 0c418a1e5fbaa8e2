/* Pulse Data BrailleNote driver. */
/*  */
/* Writes are prefixed with 0x1B, which is doubled inside the payload.  */
/* Input arrives as two-byte chord packets (dot keys combined with      */
/* space, backspace or enter), thumb keys, and routing keys. The        */
/* numeric prompts (function key, terminal number, hex character) are   */
/* collected by an input-mode state machine across read_command calls. */

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::{Capabilities, Geometry, ProtocolDriver, read_byte};
use crate::cells::{DOTS_CANONICAL, OutputTable};
use crate::command::*;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity};

const SERIAL_CONFIG: SerialConfig = SerialConfig::new(38400, SerialParity::None);

/* Host-to-unit codes. */
const BNO_BEGIN: u8 = 0x1B;
const BNO_DESCRIBE: u8 = 0x3F;
const BNO_WRITE: u8 = 0x42;

/* Unit-to-host packet codes. */
const BNI_CHARACTER: u8 = 0x80;
const BNI_SPACE: u8 = 0x81;
const BNI_BACKSPACE: u8 = 0x82;
const BNI_ENTER: u8 = 0x83;
const BNI_THUMB: u8 = 0x84;
const BNI_ROUTE: u8 = 0x85;
const BNI_DESCRIBE: u8 = 0x86;
const BNI_DISPLAY: u8 = 0x1B;

/* Dot bits within a chord byte. */
const BND_1: u8 = 0x01;
const BND_2: u8 = 0x02;
const BND_3: u8 = 0x04;
const BND_4: u8 = 0x08;
const BND_5: u8 = 0x10;
const BND_6: u8 = 0x20;

/* Thumb keys. */
const BNT_PREVIOUS: u8 = 0x01;
const BNT_BACK: u8 = 0x02;
const BNT_ADVANCE: u8 = 0x04;
const BNT_NEXT: u8 = 0x08;

/* Letter chords (six-dot patterns). */
const BNC_SPACE: u8 = 0x00;
const BNC_A: u8 = BND_1;
const BNC_B: u8 = BND_1 | BND_2;
const BNC_C: u8 = BND_1 | BND_4;
const BNC_D: u8 = BND_1 | BND_4 | BND_5;
const BNC_E: u8 = BND_1 | BND_5;
const BNC_F: u8 = BND_1 | BND_2 | BND_4;
const BNC_H: u8 = BND_1 | BND_2 | BND_5;
const BNC_I: u8 = BND_2 | BND_4;
const BNC_L: u8 = BND_1 | BND_2 | BND_3;
const BNC_M: u8 = BND_1 | BND_3 | BND_4;
const BNC_N: u8 = BND_1 | BND_3 | BND_4 | BND_5;
const BNC_O: u8 = BND_1 | BND_3 | BND_5;
const BNC_P: u8 = BND_1 | BND_2 | BND_3 | BND_4;
const BNC_R: u8 = BND_1 | BND_2 | BND_3 | BND_5;
const BNC_S: u8 = BND_2 | BND_3 | BND_4;
const BNC_T: u8 = BND_2 | BND_3 | BND_4 | BND_5;
const BNC_U: u8 = BND_1 | BND_3 | BND_6;
const BNC_V: u8 = BND_1 | BND_2 | BND_3 | BND_6;
const BNC_W: u8 = BND_2 | BND_4 | BND_5 | BND_6;
const BNC_X: u8 = BND_1 | BND_3 | BND_4 | BND_6;
const BNC_Z: u8 = BND_1 | BND_3 | BND_5 | BND_6;
const BNC_6: u8 = BND_2 | BND_3 | BND_5;
const BNC_8: u8 = BND_2 | BND_3 | BND_6;
const BNC_PERCENT: u8 = BND_1 | BND_4 | BND_6;
const BNC_LPAREN: u8 = BND_1 | BND_2 | BND_3 | BND_5 | BND_6;
const BNC_RPAREN: u8 = BND_2 | BND_3 | BND_4 | BND_5 | BND_6;
const BNC_LBRACE: u8 = BND_2 | BND_4 | BND_6;
const BNC_RBRACE: u8 = BND_1 | BND_2 | BND_4 | BND_5 | BND_6;
const BNC_BAR: u8 = BND_1 | BND_2 | BND_5 | BND_6;
const BNC_QUESTION: u8 = BND_1 | BND_4 | BND_5 | BND_6;
const BNC_ALL_SIX: u8 = BND_1 | BND_2 | BND_3 | BND_4 | BND_5 | BND_6;

/* Decimal digits in computer braille, for the numeric prompts. */
const DIGIT_CHORDS: [(u8, u8); 10] = [
    (0x02, 1), (0x06, 2), (0x12, 3), (0x32, 4), (0x22, 5),
    (0x16, 6), (0x36, 7), (0x26, 8), (0x14, 9), (0x34, 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyboardMode {
    Input,
    Input7,
    Input78,
    Input8,
    Navigate,
}

impl KeyboardMode {
    fn dot_mask(self) -> u8 {
        match self {
            KeyboardMode::Input => 0x00,
            KeyboardMode::Input7 => 0x40,
            KeyboardMode::Input78 => 0xC0,
            KeyboardMode::Input8 => 0x80,
            KeyboardMode::Navigate => 0x00,
        }
    }
}

/* Multi-keystroke collection replacing the original's nested reads:
 * while a prompt is active, read_command feeds keys here until the
 * enter chord completes the value or backspace abandons it. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prompt {
    FunctionKey { number: u32 },
    SwitchVt { number: u32 },
    HexCharacter { value: u8 },
}

pub struct BrailleNoteDriver {
    output_table: OutputTable,
    input_table: OutputTable,

    cell_buffer: Vec<u8>,
    status_offset: usize,
    status_cells: usize,
    data_offset: usize,
    data_cells: usize,

    persistent_keyboard_mode: KeyboardMode,
    temporary_keyboard_mode: KeyboardMode,
    current_keyboard_mode: KeyboardMode,

    persistent_routing_operation: i32,
    temporary_routing_operation: i32,
    current_routing_operation: i32,

    prompt: Option<Prompt>,
}

impl BrailleNoteDriver {
    pub fn new() -> Self {
        let output_table = OutputTable::build(&DOTS_CANONICAL);
        let input_table = output_table.reversed();
        Self {
            output_table,
            input_table,
            cell_buffer: Vec::new(),
            status_offset: 0,
            status_cells: 0,
            data_offset: 0,
            data_cells: 0,
            persistent_keyboard_mode: KeyboardMode::Navigate,
            temporary_keyboard_mode: KeyboardMode::Navigate,
            current_keyboard_mode: KeyboardMode::Navigate,
            persistent_routing_operation: BLK_ROUTE,
            temporary_routing_operation: BLK_ROUTE,
            current_routing_operation: BLK_ROUTE,
            prompt: None,
        }
    }

    async fn send_packet(&mut self, port: &mut Port, packet: &[u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(1 + packet.len() * 2);
        buffer.push(BNO_BEGIN);
        for byte in packet {
            buffer.push(*byte);
            if *byte == BNO_BEGIN {
                buffer.push(BNO_BEGIN);
            }
        }
        debug!("TX packet: {:02x?}", buffer);
        port.write_bytes(&buffer).await?;
        port.credit_write_delay(buffer.len());
        Ok(())
    }

    async fn refresh_cells(&mut self, port: &mut Port) -> Result<()> {
        let mut packet = Vec::with_capacity(1 + self.cell_buffer.len());
        packet.push(BNO_WRITE);
        for cell in &self.cell_buffer {
            packet.push(self.output_table.translate(*cell));
        }
        self.send_packet(port, &packet).await
    }

    async fn read_packet_raw(&mut self, port: &mut Port) -> Result<Option<Vec<u8>>> {
        let mut packet: Vec<u8> = Vec::new();
        let mut length = 0usize;

        loop {
            let Some(byte) = read_byte(port, !packet.is_empty()).await? else {
                if !packet.is_empty() {
                    debug!("Partial Packet: {:02x?}", packet);
                }
                return Ok(None);
            };

            if packet.is_empty() {
                match byte {
                    BNI_DISPLAY => length = 1,
                    BNI_CHARACTER | BNI_SPACE | BNI_BACKSPACE | BNI_ENTER | BNI_THUMB
                    | BNI_ROUTE => length = 2,
                    BNI_DESCRIBE => length = 3,
                    _ => {
                        debug!("Unknown Packet: {byte:02x}");
                        continue;
                    }
                }
            }

            packet.push(byte);
            if packet.len() == length {
                return Ok(Some(packet));
            }
        }
    }

    /* Carve host status cells out of the start of the data area. */
    fn adjust_status_cells(&mut self, parameters: &Parameters) {
        let maximum = (self.data_cells - 1) as i32;
        if let Some(cells) = parameters.integer(0, 0, maximum) {
            let cells = cells as usize;
            self.status_offset = self.data_offset;
            self.status_cells = cells;
            self.data_offset += cells;
            self.data_cells -= cells;
        }
    }

    fn interpret_navigation(&mut self, dots: u8) -> Option<i32> {
        Some(match dots {
            0 => CMD_HOME,
            d if d == BND_1 => CMD_CHRLT,
            d if d == BND_1 | BND_2 => CMD_HWINLT,
            d if d == BND_2 => CMD_FWINLT,
            d if d == BND_2 | BND_3 => CMD_FWINLTSKIP,
            d if d == BND_3 => CMD_LNBEG,
            d if d == BND_1 | BND_3 => CMD_LNUP,
            d if d == BND_1 | BND_2 | BND_3 => CMD_TOP_LEFT,
            d if d == BND_4 => CMD_CHRRT,
            d if d == BND_4 | BND_5 => CMD_HWINRT,
            d if d == BND_5 => CMD_FWINRT,
            d if d == BND_5 | BND_6 => CMD_FWINRTSKIP,
            d if d == BND_6 => CMD_LNEND,
            d if d == BND_4 | BND_6 => CMD_LNDN,
            d if d == BND_4 | BND_5 | BND_6 => CMD_BOT_LEFT,
            d if d == BND_1 | BND_4 => CMD_TOP,
            d if d == BND_2 | BND_5 => CMD_HOME,
            d if d == BND_3 | BND_6 => CMD_BOT,
            d if d == BND_1 | BND_4 | BND_5 => CMD_PRDIFLN,
            d if d == BND_2 | BND_5 | BND_6 => CMD_NXDIFLN,
            d if d == BND_1 | BND_2 | BND_4 => CMD_PRSEARCH,
            d if d == BND_2 | BND_3 | BND_5 => CMD_NXSEARCH,
            d if d == BND_1 | BND_2 | BND_5 => CMD_ATTRUP,
            d if d == BND_2 | BND_3 | BND_6 => CMD_ATTRDN,
            d if d == BND_2 | BND_4 => {
                self.temporary_routing_operation = BLK_PRINDENT;
                CMD_NOOP
            }
            d if d == BND_3 | BND_5 => {
                self.temporary_routing_operation = BLK_NXINDENT;
                CMD_NOOP
            }
            d if d == BND_2 | BND_4 | BND_5 => CMD_WINUP,
            d if d == BND_3 | BND_5 | BND_6 => CMD_WINDN,
            _ => return None,
        })
    }

    fn interpret_character(&mut self, dots: u8, context: CommandContext) -> Option<i32> {
        if context != CommandContext::Screen
            || self.current_keyboard_mode == KeyboardMode::Navigate
        {
            return self.interpret_navigation(dots);
        }
        let mask = self.current_keyboard_mode.dot_mask();
        Some(BLK_PASSDOTS + i32::from(self.input_table.translate(dots) | mask))
    }

    fn interpret_space_chord(&mut self, dots: u8, context: CommandContext) -> Option<i32> {
        match dots {
            BNC_SPACE => self.interpret_character(dots, context),
            BNC_C => Some(CMD_PREFMENU),
            BNC_D => Some(CMD_PREFLOAD),
            BNC_F => {
                self.prompt = Some(Prompt::FunctionKey { number: 0 });
                Some(CMD_NOOP)
            }
            BNC_L => {
                self.temporary_routing_operation = BLK_SETLEFT;
                Some(CMD_NOOP)
            }
            BNC_M => Some(CMD_MUTE),
            BNC_N => {
                self.persistent_keyboard_mode = KeyboardMode::Navigate;
                self.temporary_keyboard_mode = self.persistent_keyboard_mode;
                Some(CMD_NOOP)
            }
            BNC_P => Some(CMD_PASTE),
            BNC_S => Some(CMD_SAY_LINE),
            BNC_V => {
                self.prompt = Some(Prompt::SwitchVt { number: 0 });
                Some(CMD_NOOP)
            }
            BNC_W => Some(CMD_PREFSAVE),
            BNC_X => {
                self.prompt = Some(Prompt::HexCharacter { value: 0 });
                Some(CMD_NOOP)
            }
            BNC_LPAREN => {
                self.temporary_routing_operation = BLK_CUTBEGIN;
                Some(CMD_NOOP)
            }
            BNC_LBRACE => {
                self.temporary_routing_operation = BLK_CUTAPPEND;
                Some(CMD_NOOP)
            }
            BNC_RPAREN => {
                self.temporary_routing_operation = BLK_CUTRECT;
                Some(CMD_NOOP)
            }
            BNC_RBRACE => {
                self.temporary_routing_operation = BLK_CUTLINE;
                Some(CMD_NOOP)
            }
            BNC_BAR => Some(CMD_CSRJMP_VERT),
            BNC_QUESTION => Some(CMD_LEARN),
            /* These chords are consumed by the BrailleNote itself. */
            BNC_E | BNC_O | BNC_R | BNC_U | BNC_Z | BNC_PERCENT | BNC_6 | BNC_ALL_SIX => None,
            d if d == BND_2 | BND_3 | BND_5 | BND_6 => Some(BLK_PASSKEY + KEY_TAB),
            d if d == BND_2 | BND_3 => Some(BLK_PASSKEY + KEY_CURSOR_LEFT),
            d if d == BND_5 | BND_6 => Some(BLK_PASSKEY + KEY_CURSOR_RIGHT),
            d if d == BND_2 | BND_5 => Some(BLK_PASSKEY + KEY_CURSOR_UP),
            d if d == BND_3 | BND_6 => Some(BLK_PASSKEY + KEY_CURSOR_DOWN),
            d if d == BND_2 => Some(BLK_PASSKEY + KEY_HOME),
            d if d == BND_3 => Some(BLK_PASSKEY + KEY_END),
            d if d == BND_5 => Some(BLK_PASSKEY + KEY_PAGE_UP),
            d if d == BND_6 => Some(BLK_PASSKEY + KEY_PAGE_DOWN),
            d if d == BND_3 | BND_5 => Some(BLK_PASSKEY + KEY_INSERT),
            d if d == BND_2 | BND_5 | BND_6 => Some(BLK_PASSKEY + KEY_DELETE),
            d if d == BND_2 | BND_6 => Some(BLK_PASSKEY + KEY_ESCAPE),
            d if d == BND_4 || d == BND_4 | BND_5 => {
                self.set_keyboard_mode(KeyboardMode::Input, dots);
                Some(CMD_NOOP)
            }
            d if d == BND_4 | BND_3 || d == BND_4 | BND_5 | BND_3 => {
                self.set_keyboard_mode(KeyboardMode::Input7, dots);
                Some(CMD_NOOP)
            }
            d if d == BND_4 | BND_3 | BND_6 || d == BND_4 | BND_5 | BND_3 | BND_6 => {
                self.set_keyboard_mode(KeyboardMode::Input78, dots);
                Some(CMD_NOOP)
            }
            d if d == BND_4 | BND_6 || d == BND_4 | BND_5 | BND_6 => {
                self.set_keyboard_mode(KeyboardMode::Input8, dots);
                Some(CMD_NOOP)
            }
            /* The rest are handled by the BrailleNote itself. */
            _ => None,
        }
    }

    fn set_keyboard_mode(&mut self, mode: KeyboardMode, dots: u8) {
        self.temporary_keyboard_mode = mode;
        if dots & BND_5 != 0 {
            self.persistent_keyboard_mode = mode;
        }
    }

    fn interpret_backspace_chord(&mut self, dots: u8) -> Option<i32> {
        match dots & 0x3F {
            BNC_SPACE => Some(BLK_PASSKEY + KEY_BACKSPACE),
            BNC_A => Some(CMD_DISPMD | FLG_TOGGLE_ON),
            BNC_B => Some(CMD_SKPBLNKWINS | FLG_TOGGLE_OFF),
            BNC_D => {
                self.temporary_routing_operation = BLK_DESCCHAR;
                Some(CMD_NOOP)
            }
            BNC_F => Some(CMD_FREEZE | FLG_TOGGLE_OFF),
            BNC_H => Some(CMD_HELP),
            BNC_I => Some(CMD_SKPIDLNS | FLG_TOGGLE_OFF),
            BNC_M => {
                self.temporary_routing_operation = BLK_SETMARK;
                Some(CMD_NOOP)
            }
            BNC_S => Some(CMD_INFO),
            BNC_T => Some(CMD_DISPMD | FLG_TOGGLE_OFF),
            BNC_V => Some(CMD_SWITCHVT_PREV),
            BNC_W => Some(CMD_SLIDEWIN | FLG_TOGGLE_OFF),
            BNC_6 => Some(CMD_SIXDOTS | FLG_TOGGLE_ON),
            BNC_8 => Some(CMD_SIXDOTS | FLG_TOGGLE_OFF),
            BNC_ALL_SIX => Some(CMD_RESTARTSPEECH),
            _ => None,
        }
    }

    fn interpret_thumb_keys(&mut self, keys: u8) -> Option<i32> {
        Some(match keys {
            BNT_PREVIOUS => CMD_FWINLT,
            BNT_NEXT => CMD_FWINRT,
            BNT_BACK => CMD_LNUP,
            BNT_ADVANCE => CMD_LNDN,
            k if k == BNT_PREVIOUS | BNT_BACK => CMD_LNBEG,
            k if k == BNT_NEXT | BNT_ADVANCE => CMD_LNEND,
            k if k == BNT_PREVIOUS | BNT_ADVANCE => CMD_TOP_LEFT,
            k if k == BNT_PREVIOUS | BNT_NEXT => CMD_BOT_LEFT,
            k if k == BNT_BACK | BNT_ADVANCE => CMD_BACK,
            k if k == BNT_BACK | BNT_NEXT => CMD_CSRTRK,
            _ => return None,
        })
    }

    /* Feed one packet into an active prompt. Digits shift into a
     * two-place window; enter completes, backspace abandons. */
    fn interpret_prompt(&mut self, code: u8, data: u8) -> Option<i32> {
        let prompt = self.prompt?;
        match code {
            BNI_CHARACTER => {
                let digit = DIGIT_CHORDS
                    .iter()
                    .find(|(chord, _)| *chord == data)
                    .map(|(_, digit)| *digit);
                match (prompt, digit) {
                    (Prompt::FunctionKey { number }, Some(digit)) => {
                        self.prompt = Some(Prompt::FunctionKey {
                            number: (number * 10 + u32::from(digit)) % 100,
                        });
                    }
                    (Prompt::SwitchVt { number }, Some(digit)) => {
                        self.prompt = Some(Prompt::SwitchVt {
                            number: (number * 10 + u32::from(digit)) % 100,
                        });
                    }
                    (Prompt::HexCharacter { value }, _) => {
                        let nibble = match data {
                            d if DIGIT_CHORDS.iter().any(|(c, n)| *c == d && *n < 10) => digit,
                            BNC_A => Some(0xA),
                            BNC_B => Some(0xB),
                            BNC_C => Some(0xC),
                            BNC_D => Some(0xD),
                            BNC_E => Some(0xE),
                            BNC_F => Some(0xF),
                            _ => None,
                        };
                        if let Some(nibble) = nibble {
                            self.prompt = Some(Prompt::HexCharacter {
                                value: (value << 4) | nibble,
                            });
                        }
                    }
                    _ => {}
                }
                None
            }
            BNI_ENTER if data == BNC_SPACE => {
                self.prompt = None;
                Some(match prompt {
                    Prompt::FunctionKey { number } => {
                        let number = if number == 0 {
                            0x100 - KEY_FUNCTION as u32
                        } else {
                            number
                        };
                        BLK_PASSKEY + KEY_FUNCTION + number as i32 - 1
                    }
                    Prompt::SwitchVt { number } => {
                        let number = if number == 0 { 0x100 } else { number };
                        BLK_SWITCHVT + number as i32 - 1
                    }
                    Prompt::HexCharacter { value } => BLK_PASSCHAR + i32::from(value),
                })
            }
            BNI_BACKSPACE => {
                self.prompt = None;
                None
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ProtocolDriver for BrailleNoteDriver {
    fn name(&self) -> &'static str {
        "BrailleNote"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["statuscells"]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            packet_io: true,
            ..Capabilities::default()
        }
    }

    async fn open(&mut self, port: &mut Port, parameters: &Parameters) -> Result<Geometry> {
        port.configure_serial(&SERIAL_CONFIG).await?;

        self.send_packet(port, &[BNO_DESCRIBE]).await?;
        while port.await_input(Duration::from_millis(100)).await? {
            let Some(packet) = self.read_packet_raw(port).await? else {
                continue;
            };
            if packet[0] != BNI_DESCRIBE {
                warn!("Unexpected Packet: {:02x?}", packet);
                continue;
            }

            let mut status_cells = usize::from(packet[1]);
            let mut text_cells = usize::from(packet[2]);
            /* An early firmware misreports the 32/3 split as 30/5. */
            if status_cells == 5 && text_cells == 30 {
                status_cells -= 2;
                text_cells += 2;
            }

            self.status_offset = 0;
            self.status_cells = status_cells;
            self.data_offset = status_cells;
            self.data_cells = text_cells;
            self.cell_buffer = vec![0; status_cells + text_cells];

            self.persistent_keyboard_mode = KeyboardMode::Navigate;
            self.temporary_keyboard_mode = self.persistent_keyboard_mode;
            self.persistent_routing_operation = BLK_ROUTE;
            self.temporary_routing_operation = self.persistent_routing_operation;
            self.prompt = None;

            self.refresh_cells(port).await?;
            self.adjust_status_cells(parameters);
            info!(
                "BrailleNote: {} data cells, {} status cells",
                self.data_cells, self.status_cells
            );
            return Ok(self.geometry());
        }
        Err(BrailleError::ProbeFailed { driver: self.name() })
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.data_cells, self.status_cells)
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.data_cells.min(cells.len());
        let area = self.data_offset..self.data_offset + count;
        if self.cell_buffer[area.clone()] != cells[..count] {
            self.cell_buffer[area].copy_from_slice(&cells[..count]);
            self.refresh_cells(port).await?;
        }
        Ok(())
    }

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let _ = port;
        let count = self.status_cells.min(cells.len());
        let area = self.status_offset..self.status_offset + count;
        /* The next write_window refreshes the wire. */
        self.cell_buffer[area].copy_from_slice(&cells[..count]);
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        context: CommandContext,
    ) -> Result<ReadResult> {
        while let Some(packet) = self.read_packet_raw(port).await? {
            let code = packet[0];
            let data = packet.get(1).copied().unwrap_or(0);

            if self.prompt.is_some() {
                match self.interpret_prompt(code, data) {
                    Some(command) => return Ok(ReadResult::Command(command)),
                    None => continue,
                }
            }

            self.current_keyboard_mode = self.temporary_keyboard_mode;
            self.temporary_keyboard_mode = self.persistent_keyboard_mode;
            self.current_routing_operation = self.temporary_routing_operation;
            self.temporary_routing_operation = self.persistent_routing_operation;

            let command = match code {
                BNI_CHARACTER => self.interpret_character(data, context),
                BNI_SPACE => self.interpret_space_chord(data, context),
                BNI_BACKSPACE => self.interpret_backspace_chord(data),
                BNI_ENTER => match data {
                    BNC_SPACE => Some(BLK_PASSKEY + KEY_ENTER),
                    BNC_B => Some(CMD_SKPBLNKWINS | FLG_TOGGLE_ON),
                    BNC_F => Some(CMD_FREEZE | FLG_TOGGLE_ON),
                    BNC_I => Some(CMD_SKPIDLNS | FLG_TOGGLE_ON),
                    BNC_M => {
                        self.temporary_routing_operation = BLK_GOTOMARK;
                        Some(CMD_NOOP)
                    }
                    BNC_V => Some(CMD_SWITCHVT_NEXT),
                    BNC_W => Some(CMD_SLIDEWIN | FLG_TOGGLE_ON),
                    BNC_ALL_SIX => return Ok(ReadResult::Restart),
                    _ => None,
                },
                BNI_THUMB => self.interpret_thumb_keys(data),
                BNI_ROUTE => Some(self.current_routing_operation + i32::from(data)),
                BNI_DISPLAY => {
                    /* Visual passthrough belongs to the host console. */
                    debug!("display packet ignored");
                    continue;
                }
                _ => {
                    warn!("Unexpected Packet: {:02x?}", packet);
                    continue;
                }
            };

            return Ok(match command {
                Some(command) => ReadResult::Command(command),
                None => ReadResult::None,
            });
        }
        Ok(ReadResult::None)
    }

    async fn read_packet(&mut self, port: &mut Port, buf: &mut [u8]) -> Result<usize> {
        let Some(packet) = self.read_packet_raw(port).await? else {
            return Ok(0);
        };
        if buf.len() < packet.len() {
            return Err(BrailleError::BufferTooSmall {
                expected: packet.len(),
                actual: buf.len(),
            });
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write_packet(&mut self, port: &mut Port, packet: &[u8]) -> Result<usize> {
        if packet.is_empty() {
            return Err(BrailleError::BufferTooSmall {
                expected: 1,
                actual: 0,
            });
        }
        self.send_packet(port, packet).await?;
        Ok(packet.len())
    }

    async fn reset(&mut self, port: &mut Port) -> Result<()> {
        self.send_packet(port, &[BNO_DESCRIBE]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_32() -> (BrailleNoteDriver, Port) {
        let mut driver = BrailleNoteDriver::new();
        let mut port = Port::mock();
        /* The misreporting firmware: 5 status, 30 text. */
        port.mock_mut().reply_on_write(
            &[BNO_BEGIN, BNO_DESCRIBE],
            &[BNI_DESCRIBE, 5, 30],
        );
        let geometry = driver
            .open(&mut port, &Parameters::new(&["statuscells"], &[]))
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 32);
        assert_eq!(geometry.status_columns, 3);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_describe_quirk() {
        let (driver, _port) = open_32().await;
        assert_eq!(driver.data_cells, 32);
        assert_eq!(driver.status_cells, 3);
    }

    #[tokio::test]
    async fn test_write_escapes_begin_byte() {
        let (mut driver, mut port) = open_32().await;
        let mut cells = [0u8; 32];
        cells[0] = BNO_BEGIN; /* identity translation keeps the value */
        driver.write_window(&mut port, &cells).await.unwrap();
        let output = port.mock_mut().take_output();
        /* prefix + 'B' + 3 status + 32 data + 1 doubled escape */
        assert_eq!(output.len(), 1 + 1 + 3 + 32 + 1);
        assert_eq!(&output[..2], &[BNO_BEGIN, BNO_WRITE]);
        assert_eq!(&output[5..7], &[BNO_BEGIN, BNO_BEGIN]);
    }

    #[tokio::test]
    async fn test_thumb_keys() {
        let (mut driver, mut port) = open_32().await;
        port.mock_mut().push_input(&[BNI_THUMB, BNT_BACK | BNT_NEXT]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_CSRTRK));
    }

    #[tokio::test]
    async fn test_routing_operation_is_temporary() {
        let (mut driver, mut port) = open_32().await;

        /* Space-L arms set-left for exactly one routing key. */
        port.mock_mut().push_input(&[BNI_SPACE, BNC_L]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));

        port.mock_mut().push_input(&[BNI_ROUTE, 4]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_SETLEFT + 4));

        port.mock_mut().push_input(&[BNI_ROUTE, 4]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 4));
    }

    #[tokio::test]
    async fn test_function_key_prompt() {
        let (mut driver, mut port) = open_32().await;

        port.mock_mut().push_input(&[BNI_SPACE, BNC_F]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));

        /* Type "12" then enter: function key 12. */
        port.mock_mut().push_input(&[BNI_CHARACTER, 0x02]);
        port.mock_mut().push_input(&[BNI_CHARACTER, 0x06]);
        port.mock_mut().push_input(&[BNI_ENTER, BNC_SPACE]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_PASSKEY + KEY_FUNCTION + 11));
    }

    #[tokio::test]
    async fn test_prompt_backspace_cancels() {
        let (mut driver, mut port) = open_32().await;
        port.mock_mut().push_input(&[BNI_SPACE, BNC_V]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();

        port.mock_mut().push_input(&[BNI_BACKSPACE, BNC_SPACE]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::None);
        assert_eq!(driver.prompt, None);
    }

    #[tokio::test]
    async fn test_enter_all_six_restarts() {
        let (mut driver, mut port) = open_32().await;
        port.mock_mut().push_input(&[BNI_ENTER, BNC_ALL_SIX]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Restart);
    }

    #[tokio::test]
    async fn test_input_mode_passes_dots() {
        let (mut driver, mut port) = open_32().await;

        /* Space dots-45 selects input mode for one keystroke. */
        port.mock_mut().push_input(&[BNI_SPACE, BND_4]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();

        port.mock_mut().push_input(&[BNI_CHARACTER, BNC_B]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_PASSDOTS + i32::from(BNC_B)));

        /* Back to navigate on the following keystroke. */
        port.mock_mut().push_input(&[BNI_CHARACTER, BND_2]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_FWINLT));
    }
}
