/* Handy Tech driver: Modular, Braille Wave, Braille Star, Bookworm. */
/*  */
/* The unit identifies with 0xFE plus a model byte and acknowledges     */
/* every cell write with 0x7E (or 0x7D: accepted, please repeat). The   */
/* session runs a small display-state machine with timed retries, so a  */
/* silent or power-cycled unit is re-described instead of hanging. */

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use super::{Capabilities, Geometry, ProtocolDriver, read_byte};
use crate::cells::{DOTS_CANONICAL, OutputTable};
use crate::command::*;
use crate::device_spec::TransportKind;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity, UsbDeviceId};

const SERIAL_CONFIG: SerialConfig = SerialConfig::new(19200, SerialParity::Odd);

const USB_IDS: &[UsbDeviceId] = &[
    UsbDeviceId { vendor: 0x0921, product: 0x1200 }, /* GoHubs chip */
    UsbDeviceId { vendor: 0x0403, product: 0x6001 }, /* FTDI chip */
];

/* Communication codes */
const HANDY_DESCRIBE: u8 = 0xFF;
const HANDY_DESCRIPTION: u8 = 0xFE;
const HANDY_BRAILLE_START: u8 = 0x01;
const BOOKWORM_BRAILLE_END: u8 = 0x16;
const BOOKWORM_STOP: [u8; 2] = [0x05, 0x07];

const WRITE_ACK: u8 = 0x7E;
const WRITE_ACK_REPEAT: u8 = 0x7D;
const KEYCODE_PACKET: u8 = 0x79;
const MENU_BURST: u8 = 0x06;

const KEY_RELEASE: u8 = 0x80;
const KEY_ROUTING: u8 = 0x20;
const KEY_STATUS: u8 = 0x70;

const fn key(code: u8) -> u64 {
    1 << code
}

/* modular front keys */
const KEY_B1: u64 = key(0x03);
const KEY_B2: u64 = key(0x07);
const KEY_B3: u64 = key(0x0B);
const KEY_B4: u64 = key(0x0F);
const KEY_B5: u64 = key(0x13);
const KEY_B6: u64 = key(0x17);
const KEY_B7: u64 = key(0x1B);
const KEY_B8: u64 = key(0x1F);
const KEY_UP: u64 = key(0x04);
const KEY_DOWN: u64 = key(0x08);

/* modular keypad keys */
const KEY_B12: u64 = key(0x01);
const KEY_ZERO: u64 = key(0x05);
const KEY_B13: u64 = key(0x09);
const KEY_B14: u64 = key(0x0D);
const KEY_B11: u64 = key(0x11);
const KEY_ONE: u64 = key(0x15);
const KEY_TWO: u64 = key(0x19);
const KEY_THREE: u64 = key(0x1D);
const KEY_B10: u64 = key(0x02);
const KEY_FOUR: u64 = key(0x06);
const KEY_FIVE: u64 = key(0x0A);
const KEY_SIX: u64 = key(0x0E);
const KEY_B9: u64 = key(0x12);
const KEY_SEVEN: u64 = key(0x16);
const KEY_EIGHT: u64 = key(0x1A);
const KEY_NINE: u64 = key(0x1E);

/* braille wave keys */
const KEY_ESCAPE_WAVE: u64 = key(0x0C);
const KEY_SPACE_WAVE: u64 = key(0x10);
const KEY_RETURN_WAVE: u64 = key(0x14);

/* braille star keys */
const KEY_SPACE_RIGHT: u64 = key(0x18);
const ROCKER_LEFT_TOP: u64 = KEY_ESCAPE_WAVE;
const ROCKER_LEFT_BOTTOM: u64 = KEY_RETURN_WAVE;
const ROCKER_RIGHT_TOP: u64 = KEY_UP;
const ROCKER_RIGHT_BOTTOM: u64 = KEY_DOWN;

/* bookworm keys */
const BWK_BACKWARD: u8 = 0x01;
const BWK_ESCAPE: u8 = 0x02;
const BWK_ENTER: u8 = 0x04;
const BWK_FORWARD: u8 = 0x08;

const MAXIMUM_MODEL_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeysLayout {
    Modular,
    Wave,
    Star,
    Bookworm,
}

#[derive(Clone, Copy)]
struct ModelEntry {
    name: &'static str,
    identifier: u8,
    columns: usize,
    status_cells: usize,
    help_page: usize,
    layout: KeysLayout,
}

const MODEL_TABLE: &[ModelEntry] = &[
    ModelEntry { name: "Modular 20+4", identifier: 0x80, columns: 20, status_cells: 4, help_page: 0, layout: KeysLayout::Modular },
    ModelEntry { name: "Modular 40+4", identifier: 0x89, columns: 40, status_cells: 4, help_page: 0, layout: KeysLayout::Modular },
    ModelEntry { name: "Modular 80+4", identifier: 0x88, columns: 80, status_cells: 4, help_page: 0, layout: KeysLayout::Modular },
    ModelEntry { name: "Braille Wave 40", identifier: 0x05, columns: 40, status_cells: 0, help_page: 0, layout: KeysLayout::Wave },
    ModelEntry { name: "Bookworm", identifier: 0x90, columns: 8, status_cells: 0, help_page: 1, layout: KeysLayout::Bookworm },
    ModelEntry { name: "Braillino 20", identifier: 0x72, columns: 20, status_cells: 0, help_page: 2, layout: KeysLayout::Star },
    ModelEntry { name: "Braille Star 40", identifier: 0x74, columns: 40, status_cells: 0, help_page: 2, layout: KeysLayout::Star },
    ModelEntry { name: "Braille Star 80", identifier: 0x78, columns: 80, status_cells: 0, help_page: 3, layout: KeysLayout::Star },
];

/* Display states; transitions are timed so a silent unit gets a new
 * describe request instead of wedging the session. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisplayState {
    Off,
    Resetting,
    Identifying,
    Ready,
    Writing,
}

/* Keys held plus the routing or status cell touched last. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Keys {
    front: u64,
    column: Option<usize>,
    status: Option<usize>,
}

impl Keys {
    const NULL: Keys = Keys {
        front: 0,
        column: None,
        status: None,
    };
}

pub struct HandyTechDriver {
    output_table: OutputTable,
    model: ModelEntry,

    raw_data: Vec<u8>,
    prev_data: Vec<u8>,
    raw_status: Vec<u8>,
    prev_status: Vec<u8>,
    update_required: bool,

    current_state: DisplayState,
    state_time: Instant,
    retry_count: u32,

    current_keys: Keys,
    pressed_keys: Keys,
    input_mode: bool,

    at2_buffer: Vec<u8>,
}

impl HandyTechDriver {
    pub fn new() -> Self {
        Self {
            output_table: OutputTable::build(&DOTS_CANONICAL),
            model: MODEL_TABLE[0],
            raw_data: Vec::new(),
            prev_data: Vec::new(),
            raw_status: Vec::new(),
            prev_status: Vec::new(),
            update_required: false,
            current_state: DisplayState::Off,
            state_time: Instant::now(),
            retry_count: 0,
            current_keys: Keys::NULL,
            pressed_keys: Keys::NULL,
            input_mode: false,
            at2_buffer: Vec::new(),
        }
    }

    fn set_state(&mut self, state: DisplayState) {
        if state == self.current_state {
            self.retry_count += 1;
        } else {
            self.retry_count = 0;
            self.current_state = state;
        }
        self.state_time = Instant::now();
    }

    async fn write_describe(&mut self, port: &mut Port) -> Result<()> {
        port.write_bytes(&[HANDY_DESCRIBE]).await?;
        port.credit_write_delay(1);
        Ok(())
    }

    fn identify_model(&mut self, identifier: u8) -> Result<()> {
        let Some(model) = MODEL_TABLE
            .iter()
            .find(|model| model.identifier == identifier)
        else {
            warn!("Detected unknown HandyTech model with ID {identifier:02X}.");
            return Err(BrailleError::IdentityMismatch {
                identity: identifier,
            });
        };
        info!(
            "Detected {}: {} data cells, {} status cells.",
            model.name, model.columns, model.status_cells
        );

        self.model = *model;
        self.raw_data = vec![0; model.columns];
        self.prev_data = vec![0; model.columns];
        self.raw_status = vec![0; model.status_cells];
        self.prev_status = vec![0; model.status_cells];

        self.current_keys = Keys::NULL;
        self.pressed_keys = Keys::NULL;

        self.retry_count = 0;
        self.update_required = false;
        self.current_state = DisplayState::Off;
        self.set_state(DisplayState::Ready);
        Ok(())
    }

    async fn update_braille_cells(&mut self, port: &mut Port) -> Result<()> {
        if !self.update_required || self.current_state != DisplayState::Ready {
            return Ok(());
        }
        let mut buffer =
            Vec::with_capacity(2 + self.model.status_cells + self.model.columns);
        buffer.push(HANDY_BRAILLE_START);
        buffer.extend_from_slice(&self.raw_status);
        buffer.extend_from_slice(&self.raw_data);
        if self.model.layout == KeysLayout::Bookworm {
            buffer.push(BOOKWORM_BRAILLE_END);
        }
        port.write_bytes(&buffer).await?;
        port.credit_write_delay(buffer.len());
        self.set_state(DisplayState::Writing);
        self.update_required = false;
        Ok(())
    }

    fn interpret_key_byte(&mut self, context: CommandContext, byte: u8) -> Option<i32> {
        let release = byte & KEY_RELEASE != 0;
        let byte = byte & !KEY_RELEASE;

        self.current_keys.column = None;
        self.current_keys.status = None;

        if (KEY_ROUTING..KEY_ROUTING + self.model.columns as u8).contains(&byte) {
            if !release {
                self.current_keys.column = Some(usize::from(byte - KEY_ROUTING));
                if let Some(command) = self.interpret_keys(context, self.current_keys) {
                    self.pressed_keys = Keys::NULL;
                    return Some(command);
                }
            }
            return Some(CMD_NOOP);
        }

        if (KEY_STATUS..KEY_STATUS + self.model.status_cells as u8).contains(&byte) {
            if !release {
                self.current_keys.status = Some(usize::from(byte - KEY_STATUS));
                if let Some(command) = self.interpret_keys(context, self.current_keys) {
                    self.pressed_keys = Keys::NULL;
                    return Some(command);
                }
            }
            return Some(CMD_NOOP);
        }

        if byte < 0x20 {
            let bit = key(byte);
            if release {
                self.current_keys.front &= !bit;
                if self.pressed_keys.front != 0 {
                    let command = self.interpret_keys(context, self.pressed_keys);
                    self.pressed_keys = Keys::NULL;
                    return Some(command.unwrap_or(CMD_NOOP));
                }
                return Some(CMD_NOOP);
            }
            self.current_keys.front |= bit;
            self.pressed_keys = self.current_keys;
            if let Some(command) = self.interpret_keys(context, self.current_keys) {
                return Some(command | FLG_REPEAT_DELAY);
            }
            return Some(CMD_NOOP);
        }

        None
    }

    fn interpret_keys(&mut self, context: CommandContext, keys: Keys) -> Option<i32> {
        match self.model.layout {
            KeysLayout::Modular => self.interpret_modular_keys(context, keys),
            KeysLayout::Wave => self.interpret_wave_keys(keys),
            KeysLayout::Star => self.interpret_star_keys(keys),
            KeysLayout::Bookworm => None,
        }
    }

    fn column_chord(keys: Keys, column: usize) -> Option<i32> {
        let column = column as i32;
        Some(match keys.front {
            0 => BLK_ROUTE + column,
            KEY_B1 => BLK_SETLEFT + column,
            KEY_B2 => BLK_DESCCHAR + column,
            KEY_B3 => BLK_CUTAPPEND + column,
            KEY_B4 => BLK_CUTBEGIN + column,
            KEY_UP => BLK_PRINDENT + column,
            KEY_DOWN => BLK_NXINDENT + column,
            KEY_B5 => BLK_CUTRECT + column,
            KEY_B6 => BLK_CUTLINE + column,
            KEY_B7 => BLK_SETMARK + column,
            KEY_B8 => BLK_GOTOMARK + column,
            _ => return None,
        })
    }

    fn interpret_modular_keys(&mut self, _context: CommandContext, keys: Keys) -> Option<i32> {
        if let Some(column) = keys.column {
            return Self::column_chord(keys, column);
        }
        if let Some(status) = keys.status {
            return Some(match status {
                0 => CMD_HELP,
                1 => CMD_PREFMENU,
                2 => CMD_INFO,
                3 => CMD_FREEZE,
                _ => return None,
            });
        }

        match keys.front {
            f if f == KEY_B1 | KEY_B8 | KEY_UP => {
                self.input_mode = false;
                return Some(CMD_NOOP);
            }
            f if f == KEY_B1 | KEY_B8 | KEY_DOWN => {
                self.input_mode = true;
                return Some(CMD_NOOP);
            }
            _ => {}
        }

        let command = match keys.front {
            KEY_B9 => CMD_SAY_ABOVE,
            KEY_B10 => CMD_SAY_LINE,
            KEY_B11 => CMD_SAY_BELOW,
            KEY_B12 => CMD_MUTE,
            KEY_ZERO => CMD_SPKHOME,
            KEY_B13 => CMD_SWITCHVT_PREV,
            KEY_B14 => CMD_SWITCHVT_NEXT,
            KEY_SEVEN => CMD_LEARN,
            KEY_EIGHT => CMD_MENU_PREV_ITEM,
            KEY_NINE => CMD_MENU_FIRST_ITEM,
            KEY_FOUR => CMD_MENU_PREV_SETTING,
            KEY_FIVE => CMD_PREFSAVE,
            KEY_SIX => CMD_MENU_NEXT_SETTING,
            KEY_ONE => CMD_PREFMENU,
            KEY_TWO => CMD_MENU_NEXT_ITEM,
            KEY_THREE => CMD_MENU_LAST_ITEM,
            f if f == KEY_ZERO | KEY_SEVEN => BLK_PASSKEY + KEY_HOME,
            f if f == KEY_ZERO | KEY_EIGHT => BLK_PASSKEY + KEY_CURSOR_UP,
            f if f == KEY_ZERO | KEY_NINE => BLK_PASSKEY + KEY_PAGE_UP,
            f if f == KEY_ZERO | KEY_FOUR => BLK_PASSKEY + KEY_CURSOR_LEFT,
            f if f == KEY_ZERO | KEY_SIX => BLK_PASSKEY + KEY_CURSOR_RIGHT,
            f if f == KEY_ZERO | KEY_ONE => BLK_PASSKEY + KEY_END,
            f if f == KEY_ZERO | KEY_TWO => BLK_PASSKEY + KEY_CURSOR_DOWN,
            f if f == KEY_ZERO | KEY_THREE => BLK_PASSKEY + KEY_PAGE_DOWN,
            f if f == KEY_ZERO | KEY_B13 => BLK_PASSKEY + KEY_INSERT,
            f if f == KEY_ZERO | KEY_B14 => BLK_PASSKEY + KEY_DELETE,
            KEY_UP => CMD_LNUP,
            KEY_DOWN => CMD_LNDN,
            KEY_B2 => CMD_FWINLT,
            KEY_B5 => CMD_FWINRT,
            KEY_B3 => CMD_CHRLT,
            KEY_B6 => CMD_CHRRT,
            KEY_B1 => CMD_TOP_LEFT,
            KEY_B8 => CMD_BOT_LEFT,
            f if f == KEY_B2 | KEY_B3 => CMD_LNBEG,
            f if f == KEY_B5 | KEY_B6 => CMD_LNEND,
            f if f == KEY_B1 | KEY_B2 => CMD_TOP,
            f if f == KEY_B7 | KEY_B8 => CMD_BOT,
            f if f == KEY_B4 | KEY_UP => CMD_PRDIFLN,
            f if f == KEY_B4 | KEY_DOWN => CMD_NXDIFLN,
            _ => {
                /* Mark/function banks: B9..B12 select the block, a
                 * keypad digit supplies the offset. */
                const FUNCTION_KEYS: u64 = KEY_B9 | KEY_B10 | KEY_B11 | KEY_B12;
                let block = match keys.front & FUNCTION_KEYS {
                    KEY_B9 => BLK_SETMARK,
                    KEY_B10 => BLK_GOTOMARK,
                    KEY_B11 => BLK_SWITCHVT,
                    KEY_B12 => BLK_PASSKEY + KEY_FUNCTION,
                    _ => return None,
                };
                let offset = match keys.front & !FUNCTION_KEYS {
                    KEY_ONE => 0,
                    KEY_TWO => 1,
                    KEY_THREE => 2,
                    KEY_FOUR => 3,
                    KEY_FIVE => 4,
                    KEY_SIX => 5,
                    KEY_SEVEN => 6,
                    KEY_EIGHT => 7,
                    KEY_NINE => 8,
                    KEY_ZERO => 9,
                    KEY_B13 => 10,
                    KEY_B14 => 11,
                    _ => return None,
                };
                block + offset
            }
        };
        Some(command)
    }

    fn interpret_wave_keys(&mut self, keys: Keys) -> Option<i32> {
        if let Some(column) = keys.column {
            return Self::column_chord(keys, column);
        }

        Some(match keys.front {
            KEY_UP => CMD_LNUP,
            KEY_DOWN => CMD_LNDN,
            KEY_ESCAPE_WAVE => CMD_TOP_LEFT,
            KEY_RETURN_WAVE => CMD_BOT_LEFT,
            KEY_SPACE_WAVE => CMD_HOME,
            f if f == KEY_SPACE_WAVE | KEY_UP => CMD_TOP,
            f if f == KEY_SPACE_WAVE | KEY_DOWN => CMD_BOT,
            f if f == KEY_ESCAPE_WAVE | KEY_UP => CMD_PRDIFLN,
            f if f == KEY_ESCAPE_WAVE | KEY_DOWN => CMD_NXDIFLN,
            f if f == KEY_RETURN_WAVE | KEY_UP => CMD_ATTRUP,
            f if f == KEY_RETURN_WAVE | KEY_DOWN => CMD_ATTRDN,
            f if f == KEY_ESCAPE_WAVE | KEY_RETURN_WAVE => CMD_PREFMENU,
            f if f == KEY_SPACE_WAVE | KEY_ESCAPE_WAVE => BLK_PASSKEY + KEY_BACKSPACE,
            f if f == KEY_SPACE_WAVE | KEY_RETURN_WAVE => BLK_PASSKEY + KEY_ENTER,
            f if self.input_mode && f & !WAVE_DOT_KEYS == 0 && f & WAVE_DOT_KEYS != 0 => {
                let mut dots = 0;
                for (bit, dot) in WAVE_DOT_TABLE {
                    if f & bit != 0 {
                        dots |= dot;
                    }
                }
                BLK_PASSDOTS + dots
            }
            _ => return None,
        })
    }

    fn interpret_star_keys(&mut self, keys: Keys) -> Option<i32> {
        if let Some(column) = keys.column {
            return Self::column_chord(keys, column);
        }

        Some(match keys.front {
            ROCKER_LEFT_TOP => CMD_LNUP,
            ROCKER_LEFT_BOTTOM => CMD_LNDN,
            ROCKER_RIGHT_TOP => CMD_FWINLT,
            ROCKER_RIGHT_BOTTOM => CMD_FWINRT,
            KEY_SPACE_WAVE => CMD_TOP_LEFT,
            KEY_SPACE_RIGHT => CMD_HOME,
            f if f == KEY_SPACE_WAVE | ROCKER_LEFT_TOP => CMD_TOP,
            f if f == KEY_SPACE_WAVE | ROCKER_LEFT_BOTTOM => CMD_BOT,
            f if f == KEY_SPACE_RIGHT | ROCKER_RIGHT_TOP => CMD_PRDIFLN,
            f if f == KEY_SPACE_RIGHT | ROCKER_RIGHT_BOTTOM => CMD_NXDIFLN,
            f if f == KEY_SPACE_WAVE | KEY_SPACE_RIGHT => CMD_PREFMENU,
            _ => return None,
        })
    }

    fn interpret_bookworm_byte(&mut self, context: CommandContext, byte: u8) -> Option<i32> {
        if context == CommandContext::Prefs {
            match byte {
                BWK_BACKWARD => return Some(CMD_MENU_PREV_ITEM),
                BWK_FORWARD => return Some(CMD_MENU_NEXT_ITEM),
                BWK_ESCAPE => return Some(CMD_PREFMENU),
                BWK_ENTER => return Some(CMD_MENU_NEXT_SETTING),
                b if b == BWK_BACKWARD | BWK_FORWARD | BWK_ESCAPE => return Some(CMD_NOOP),
                b if b == BWK_BACKWARD | BWK_FORWARD | BWK_ENTER => return Some(CMD_NOOP),
                _ => {}
            }
        }

        Some(match byte {
            BWK_BACKWARD => CMD_FWINLT,
            BWK_FORWARD => CMD_FWINRT,
            BWK_ESCAPE => CMD_CSRTRK,
            b if b == BWK_ESCAPE | BWK_BACKWARD => CMD_BACK,
            b if b == BWK_ESCAPE | BWK_FORWARD => CMD_DISPMD,
            BWK_ENTER => BLK_ROUTE,
            b if b == BWK_ENTER | BWK_BACKWARD => CMD_LNUP,
            b if b == BWK_ENTER | BWK_FORWARD => CMD_LNDN,
            b if b == BWK_ESCAPE | BWK_ENTER => CMD_PREFMENU,
            b if b == BWK_ESCAPE | BWK_ENTER | BWK_BACKWARD => CMD_LNBEG,
            b if b == BWK_ESCAPE | BWK_ENTER | BWK_FORWARD => CMD_LNEND,
            b if b == BWK_BACKWARD | BWK_FORWARD => CMD_HELP,
            b if b == BWK_BACKWARD | BWK_FORWARD | BWK_ESCAPE => CMD_CSRSIZE,
            b if b == BWK_BACKWARD | BWK_FORWARD | BWK_ENTER => CMD_FREEZE,
            _ => return None,
        })
    }

    /* Keycode packets: 0x79, the model id, a length, a subcode, data,
     * and the 0x16 trailer. Subcode 0x09 carries AT2 scancodes. */
    async fn read_keycode_packet(&mut self, port: &mut Port) -> Result<Option<i32>> {
        let mut header = [0u8; 2];
        if port.read_bytes(&mut header, true).await? != header.len() {
            return Ok(None);
        }
        if header[0] != self.model.identifier {
            warn!("Keycode packet ID mismatch");
            return Ok(None);
        }
        let length = usize::from(header[1]);
        let mut data = vec![0u8; length + 1];
        if port.read_bytes(&mut data, true).await? != data.len() {
            return Ok(None);
        }
        if data[length] != BOOKWORM_BRAILLE_END {
            warn!("Malformed keycode packet: {:02x?}", data);
            return Ok(None);
        }

        if length >= 2 && data[0] == 0x09 {
            let code = data[1];
            self.at2_buffer.extend_from_slice(&data[2..length]);
            return Ok(Some(BLK_PASSAT2 + i32::from(code)));
        }
        Ok(None)
    }
}

/* Wave dot keys B1..B8 map straight onto dots 1..8. */
const WAVE_DOT_KEYS: u64 =
    KEY_B1 | KEY_B2 | KEY_B3 | KEY_B4 | KEY_B5 | KEY_B6 | KEY_B7 | KEY_B8;
const WAVE_DOT_TABLE: [(u64, i32); 8] = [
    (KEY_B1, DOT1),
    (KEY_B2, DOT2),
    (KEY_B3, DOT3),
    (KEY_B4, DOT4),
    (KEY_B5, DOT5),
    (KEY_B6, DOT6),
    (KEY_B7, DOT7),
    (KEY_B8, DOT8),
];

#[async_trait]
impl ProtocolDriver for HandyTechDriver {
    fn name(&self) -> &'static str {
        "HandyTech"
    }

    fn parameter_names(&self) -> &'static [&'static str] {
        &["inputmode"]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            packet_io: true,
            key_codes: true,
            ..Capabilities::default()
        }
    }

    fn supported_transports(&self) -> &'static [TransportKind] {
        &[TransportKind::Serial, TransportKind::Usb, TransportKind::Bluetooth]
    }

    fn usb_ids(&self) -> &'static [UsbDeviceId] {
        USB_IDS
    }

    async fn open(&mut self, port: &mut Port, parameters: &Parameters) -> Result<Geometry> {
        port.configure_serial(&SERIAL_CONFIG).await?;
        self.at2_buffer.clear();

        for _ in 0..3 {
            self.write_describe(port).await?;
            while port.await_input(Duration::from_millis(100)).await? {
                let mut response = [0u8; 2];
                if port.read_bytes(&mut response, false).await? != response.len() {
                    continue;
                }
                if response[0] != HANDY_DESCRIPTION {
                    continue;
                }
                self.identify_model(response[1])?;
                self.input_mode = parameters.yes_no(0, false);
                return Ok(self.geometry());
            }
        }
        Err(BrailleError::ProbeFailed { driver: self.name() })
    }

    async fn close(&mut self, port: &mut Port) {
        if self.model.layout == KeysLayout::Bookworm {
            let _ = port.write_bytes(&BOOKWORM_STOP).await;
        }
    }

    fn geometry(&self) -> Geometry {
        let mut geometry = Geometry::new(self.model.columns, self.model.status_cells);
        geometry.help_page = self.model.help_page;
        geometry
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.model.columns.min(cells.len());
        if self.prev_data[..count] != cells[..count] {
            self.prev_data[..count].copy_from_slice(&cells[..count]);
            for index in 0..count {
                self.raw_data[index] = self.output_table.translate(cells[index]);
            }
            self.update_required = true;
        }
        self.update_braille_cells(port).await
    }

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let _ = port;
        let count = self.model.status_cells.min(cells.len());
        if self.prev_status[..count] != cells[..count] {
            self.prev_status[..count].copy_from_slice(&cells[..count]);
            for index in 0..count {
                self.raw_status[index] = self.output_table.translate(cells[index]);
            }
            self.update_required = true;
        }
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        context: CommandContext,
    ) -> Result<ReadResult> {
        if !self.at2_buffer.is_empty() {
            let code = self.at2_buffer.remove(0);
            return Ok(ReadResult::Command(BLK_PASSAT2 + i32::from(code)));
        }

        let mut timed_out = true;
        while let Some(byte) = read_byte(port, false).await? {
            timed_out = false;

            if byte == MENU_BURST && self.current_state != DisplayState::Off {
                /* A burst of 0x06 means the unit rebooted into its own
                 * menu; treat it as off until it identifies again. */
                if port.await_input(Duration::from_millis(10)).await? {
                    self.set_state(DisplayState::Off);
                    continue;
                }
            }

            if byte == HANDY_DESCRIPTION {
                self.set_state(DisplayState::Identifying);
                continue;
            }

            match self.current_state {
                DisplayState::Off => continue,
                DisplayState::Resetting => {}
                DisplayState::Identifying => {
                    if byte == self.model.identifier {
                        self.set_state(DisplayState::Ready);
                        self.update_required = true;
                        self.current_keys = Keys::NULL;
                        self.pressed_keys = Keys::NULL;
                        continue;
                    }
                }
                DisplayState::Writing | DisplayState::Ready => {
                    if self.current_state == DisplayState::Writing {
                        match byte {
                            WRITE_ACK_REPEAT => {
                                self.update_required = true;
                                self.set_state(DisplayState::Ready);
                                continue;
                            }
                            WRITE_ACK => {
                                self.set_state(DisplayState::Ready);
                                continue;
                            }
                            _ => {}
                        }
                    }

                    if byte == KEYCODE_PACKET {
                        if let Some(command) = self.read_keycode_packet(port).await? {
                            return Ok(ReadResult::Command(command));
                        }
                        continue;
                    }

                    if self.model.layout == KeysLayout::Bookworm {
                        if let Some(command) = self.interpret_bookworm_byte(context, byte) {
                            self.update_braille_cells(port).await?;
                            return Ok(ReadResult::Command(command));
                        }
                    } else if let Some(command) = self.interpret_key_byte(context, byte) {
                        self.update_braille_cells(port).await?;
                        return Ok(ReadResult::Command(command));
                    }
                }
            }

            warn!(
                "Unexpected byte: {byte:02X} (state {:?})",
                self.current_state
            );
        }

        if timed_out {
            match self.current_state {
                DisplayState::Off | DisplayState::Ready => {}
                DisplayState::Resetting => {
                    if self.state_time.elapsed() > Duration::from_millis(3000) {
                        if self.retry_count > MAXIMUM_MODEL_RETRIES {
                            self.set_state(DisplayState::Off);
                        } else {
                            self.write_describe(port).await?;
                            self.set_state(DisplayState::Resetting);
                        }
                    }
                }
                DisplayState::Identifying => {
                    if self.state_time.elapsed() > Duration::from_millis(1000) {
                        self.write_describe(port).await?;
                        self.set_state(DisplayState::Resetting);
                    }
                }
                DisplayState::Writing => {
                    if self.state_time.elapsed() > Duration::from_millis(1000) {
                        if self.retry_count > MAXIMUM_MODEL_RETRIES {
                            self.write_describe(port).await?;
                            self.set_state(DisplayState::Resetting);
                        } else {
                            self.update_required = true;
                        }
                    }
                }
            }
        }
        self.update_braille_cells(port).await?;

        Ok(ReadResult::None)
    }

    async fn read_packet(&mut self, port: &mut Port, buf: &mut [u8]) -> Result<usize> {
        port.read_bytes(buf, false).await
    }

    async fn write_packet(&mut self, port: &mut Port, packet: &[u8]) -> Result<usize> {
        if packet.is_empty() {
            return Err(BrailleError::BufferTooSmall {
                expected: 1,
                actual: 0,
            });
        }
        port.write_bytes(packet).await?;
        port.credit_write_delay(packet.len());
        Ok(packet.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_modular_40() -> (HandyTechDriver, Port) {
        let mut driver = HandyTechDriver::new();
        let mut port = Port::mock();
        port.mock_mut()
            .reply_on_write(&[HANDY_DESCRIBE], &[HANDY_DESCRIPTION, 0x89]);
        let geometry = driver
            .open(&mut port, &Parameters::new(driver.parameter_names(), &[]))
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 40);
        assert_eq!(geometry.status_columns, 4);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_identifies_model() {
        let (driver, _port) = open_modular_40().await;
        assert_eq!(driver.model.name, "Modular 40+4");
        assert_eq!(driver.current_state, DisplayState::Ready);
    }

    #[tokio::test]
    async fn test_write_enters_writing_state() {
        let (mut driver, mut port) = open_modular_40().await;
        driver.write_window(&mut port, &[1u8; 40]).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], HANDY_BRAILLE_START);
        assert_eq!(output.len(), 1 + 4 + 40);
        assert_eq!(driver.current_state, DisplayState::Writing);

        /* No second frame goes out until the acknowledgement. */
        driver.write_window(&mut port, &[2u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());

        port.mock_mut().push_input(&[WRITE_ACK]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], HANDY_BRAILLE_START);
        assert_eq!(driver.current_state, DisplayState::Writing);
    }

    #[tokio::test]
    async fn test_ack_repeat_resends() {
        let (mut driver, mut port) = open_modular_40().await;
        driver.write_window(&mut port, &[1u8; 40]).await.unwrap();
        port.mock_mut().take_output();

        port.mock_mut().push_input(&[WRITE_ACK_REPEAT]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], HANDY_BRAILLE_START);
    }

    #[tokio::test]
    async fn test_routing_key() {
        let (mut driver, mut port) = open_modular_40().await;
        port.mock_mut().push_input(&[KEY_ROUTING + 6]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 6));
    }

    #[tokio::test]
    async fn test_front_key_emits_on_release() {
        let (mut driver, mut port) = open_modular_40().await;

        /* Up key press: movement repeats, emits with the delay flag. */
        port.mock_mut().push_input(&[0x04]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_LNUP | FLG_REPEAT_DELAY));

        port.mock_mut().push_input(&[0x04 | KEY_RELEASE]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_LNUP));
    }

    #[tokio::test]
    async fn test_status_cell_key() {
        let (mut driver, mut port) = open_modular_40().await;
        port.mock_mut().push_input(&[KEY_STATUS + 2]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_INFO));
    }

    #[tokio::test]
    async fn test_reidentify_after_power_cycle() {
        let (mut driver, mut port) = open_modular_40().await;
        driver.write_window(&mut port, &[3u8; 40]).await.unwrap();
        port.mock_mut().take_output();

        /* The unit comes back and identifies unsolicited. */
        port.mock_mut().push_input(&[HANDY_DESCRIPTION, 0x89]);
        driver.read_command(&mut port, CommandContext::Screen).await.unwrap();
        assert_eq!(driver.current_state, DisplayState::Writing);

        /* update_required was raised, so the cells were re-sent. */
        let output = port.mock_mut().take_output();
        assert_eq!(output[0], HANDY_BRAILLE_START);
    }

    #[tokio::test]
    async fn test_at2_keycode_packet() {
        let (mut driver, mut port) = open_modular_40().await;
        port.mock_mut().push_input(&[
            KEYCODE_PACKET,
            0x89, /* model id */
            3,    /* length */
            0x09, /* subcode: AT2 */
            0x1C,
            0x1D,
            BOOKWORM_BRAILLE_END,
        ]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_PASSAT2 + 0x1C));
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_PASSAT2 + 0x1D));
    }

    #[tokio::test]
    async fn test_bookworm_keys() {
        let mut driver = HandyTechDriver::new();
        let mut port = Port::mock();
        port.mock_mut()
            .reply_on_write(&[HANDY_DESCRIBE], &[HANDY_DESCRIPTION, 0x90]);
        driver
            .open(&mut port, &Parameters::new(driver.parameter_names(), &[]))
            .await
            .unwrap();
        port.mock_mut().take_output();

        port.mock_mut().push_input(&[BWK_ENTER | BWK_BACKWARD]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_LNUP));
    }
}
