/* TSI driver: Navigator 20/40/80 and PowerBraille 40/65/80. */
/*  */
/* Detection queries at 9600 baud, then offers 19200 to the PowerBraille */
/* models and falls back if the display does not follow (a TSI emulator  */
/* behind the port). Writes are attribute/cell pairs behind a fixed      */
/* header with an offset and length; every 12th window is re-sent in     */
/* full to clear silent garbling (every window for emulators). An idle   */
/* ping watches for the display being powered off. */
/*  */
/* The Navigator has no routing keys, so a cursor-select mode simulates  */
/* them: a chord puts read_command into a mode that moves an on-display  */
/* cursor and finally emits the compound cut command. */

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Geometry, ProtocolDriver, read_byte};
use crate::cells::{DOTS_CANONICAL, OutputTable, diff_range};
use crate::command::*;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{Port, SerialConfig, SerialParity};

/* Communication codes */
const BRL_QUERY: [u8; 3] = [0xFF, 0xFF, 0x0A];
const BRL_TYPEMATIC: [u8; 3] = [0xFF, 0xFF, 0x0D];
const BRL_UART192: [u8; 4] = [0xFF, 0xFF, 0x05, 0x04];
const BRL_SEND_HEAD: [u8; 6] = [0xFF, 0xFF, 0x04, 0x00, 0x99, 0x00];

const TYPEMATIC_DELAY: u8 = 0x0A;
const TYPEMATIC_REPEAT: u8 = 0x05;

/* Query reply: 2-byte header, cell count, version. */
const Q_REPLY_LENGTH: usize = 12;
const Q_HEADER: [u8; 2] = [0x00, 0x05];
const Q_OFFSET_COLS: usize = 2;
const Q_OFFSET_VERSION: usize = 4;

/* Each key byte carries a signature in its 3 most significant bits. */
const KEY_SIGMASK: u8 = 0xE0;

struct InByteDescription {
    signature: u8,
    mask: u8,
    shift: u32,
}

/* Navigator and PB40: two bytes. */
const NAV_KEY_DESCRIPTION: [InByteDescription; 2] = [
    InByteDescription { signature: 0x60, mask: 0x1F, shift: 0 },
    InByteDescription { signature: 0xE0, mask: 0x1F, shift: 5 },
];

/* PB65/80: six bytes. */
const PB_KEY_DESCRIPTION: [InByteDescription; 6] = [
    InByteDescription { signature: 0x40, mask: 0x0F, shift: 10 },
    InByteDescription { signature: 0xC0, mask: 0x0F, shift: 14 },
    InByteDescription { signature: 0x20, mask: 0x05, shift: 18 },
    InByteDescription { signature: 0xA0, mask: 0x05, shift: 21 },
    InByteDescription { signature: 0x60, mask: 0x1F, shift: 24 },
    InByteDescription { signature: 0xE0, mask: 0x1F, shift: 5 },
];

/* Navigator / PB40 keys. */
const KEY_BLEFT: u32 = 1 << 0;
const KEY_BUP: u32 = 1 << 1;
const KEY_BRIGHT: u32 = 1 << 2;
const KEY_BDOWN: u32 = 1 << 3;
const KEY_BROUND: u32 = 1 << 4;
const KEY_CLEFT: u32 = 1 << 5;
const KEY_CUP: u32 = 1 << 6;
const KEY_CRIGHT: u32 = 1 << 7;
const KEY_CDOWN: u32 = 1 << 8;
const KEY_CROUND: u32 = 1 << 9;

/* PB65/80 keys (several are renames of the Navigator bits). */
const KEY_BAR1: u32 = 1 << 24;
const KEY_R2UP: u32 = 1 << 25;
const KEY_BAR2: u32 = 1 << 26;
const KEY_R2DN: u32 = 1 << 27;
const KEY_CNCV: u32 = 1 << 28;
const KEY_BUT1: u32 = 1 << 5;
const KEY_R1UP: u32 = 1 << 6;
const KEY_BUT2: u32 = 1 << 7;
const KEY_R1DN: u32 = 1 << 8;
const KEY_BAR3: u32 = 1 << 18;
const KEY_BAR4: u32 = 1 << 20;
const KEY_BUT3: u32 = 1 << 21;
const KEY_BUT4: u32 = 1 << 23;

/* Special two-byte headers (the first byte is 0x00 for both). */
const BATTERY_H1: u8 = 0x00;
const BATTERY_H2: u8 = 0x01;
const KEY_SW_H2: u8 = 0x08;

/* Routing sensor bitmaps: four vertical bytes are skipped, the rest is
 * one bit per cell. */
const SW_NVERT: usize = 4;
const SW_MAXHORIZ: usize = 11;
const SW_CNT40: u8 = 9;
const SW_CNT80: u8 = 14;
const SW_CNT81: u8 = 15;

const FULL_FRESHEN_EVERY: i32 = 12;

/* Idle keepalive. */
const PING_INTERVAL: Duration = Duration::from_millis(2000);
const PING_REPLY_DELAY: Duration = Duration::from_millis(300);
const PING_MAXNQUERY: u32 = 2;

const NONREPEAT_TIMEOUT: Duration = Duration::from_millis(300);

/* Dot pattern overlaying the simulated cursor in cursor-select mode. */
const CUT_CURSOR_CHAR: u8 = 0xFF;

/* Commands it is OK to autorepeat. */
const REPEAT_LIST: [i32; 13] = [
    CMD_FWINRT,
    CMD_FWINLT,
    CMD_LNUP,
    CMD_LNDN,
    CMD_WINUP,
    CMD_WINDN,
    CMD_CHRLT,
    CMD_CHRRT,
    BLK_PASSKEY + KEY_CURSOR_LEFT,
    BLK_PASSKEY + KEY_CURSOR_RIGHT,
    BLK_PASSKEY + KEY_CURSOR_UP,
    BLK_PASSKEY + KEY_CURSOR_DOWN,
    CMD_CSRTRK,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisplayType {
    Navigator2040,
    Navigator80,
    PowerBraille40,
    PowerBraille6580,
}

/* Cursor-select mode, replacing real routing keys on the Navigator.
 * While active, movement chords drive the simulated cursor and the cut
 * chords finish with a compound command. */
#[derive(Debug, Clone, Copy)]
struct CursorSelect {
    position: i32,
}

pub struct TsiDriver {
    output_table: OutputTable,

    display_type: DisplayType,
    cells: usize,
    columns: usize,
    has_routing: bool,
    routing_byte_count: u8,
    last_routing_key: u8,
    version: String,
    full_freshen_every: i32,

    display_buffer: Vec<u8>,
    previous_cells: Vec<u8>,
    write_count: i32,

    routing_accumulated: [u8; SW_MAXHORIZ],
    routing_live: bool,
    ignore_routing: bool,

    pending_command: Option<i32>,
    cursor_select: Option<CursorSelect>,
    cursor_memory: i32,

    last_ping: Instant,
    last_ping_sent: Instant,
    pings: u32,

    last_command: i32,
    last_command_time: Instant,
}

impl TsiDriver {
    pub fn new() -> Self {
        Self {
            output_table: OutputTable::build(&DOTS_CANONICAL),
            display_type: DisplayType::Navigator2040,
            cells: 0,
            columns: 0,
            has_routing: false,
            routing_byte_count: 0,
            last_routing_key: 0,
            version: String::new(),
            full_freshen_every: FULL_FRESHEN_EVERY,
            display_buffer: Vec::new(),
            previous_cells: Vec::new(),
            write_count: 0,
            routing_accumulated: [0; SW_MAXHORIZ],
            routing_live: false,
            ignore_routing: false,
            pending_command: None,
            cursor_select: None,
            cursor_memory: -1,
            last_ping: Instant::now(),
            last_ping_sent: Instant::now(),
            pings: 0,
            last_command: CMD_NOOP,
            last_command_time: Instant::now(),
        }
    }

    async fn query_display(&mut self, port: &mut Port) -> Result<Option<[u8; Q_REPLY_LENGTH]>> {
        port.write_bytes(&BRL_QUERY).await?;
        port.credit_write_delay(BRL_QUERY.len());
        if !port.await_input(Duration::from_millis(100)).await? {
            return Ok(None);
        }
        let mut reply = [0u8; Q_REPLY_LENGTH];
        let count = port.read_bytes(&mut reply, true).await?;
        if count == Q_REPLY_LENGTH && reply[..2] == Q_HEADER {
            debug!("TSI Reply: {:02x?}", reply);
            Ok(Some(reply))
        } else {
            warn!("Unexpected Response: {:02x?}", &reply[..count]);
            Ok(None)
        }
    }

    async fn reset_typematic(&mut self, port: &mut Port) -> Result<()> {
        port.write_bytes(&BRL_TYPEMATIC).await?;
        port.write_bytes(&[TYPEMATIC_DELAY, TYPEMATIC_REPEAT]).await?;
        port.credit_write_delay(BRL_TYPEMATIC.len() + 2);
        Ok(())
    }

    /* Send one attribute/cell pair frame for cells start..=stop. */
    async fn send_range(&mut self, port: &mut Port, start: usize, stop: usize) -> Result<()> {
        let length = stop - start + 1;
        let mut frame = Vec::with_capacity(BRL_SEND_HEAD.len() + 2 + length * 2);
        frame.extend_from_slice(&BRL_SEND_HEAD);
        frame.push((2 * length) as u8);
        frame.push(start as u8);
        for index in start..=stop {
            frame.push(0); /* attributes */
            frame.push(self.output_table.translate(self.display_buffer[index]));
        }
        port.write_bytes(&frame).await?;
        port.credit_write_delay(frame.len());
        port.drain_output().await?;
        Ok(())
    }

    async fn send_all(&mut self, port: &mut Port) -> Result<()> {
        let stop = self.cells - 1;
        self.send_range(port, 0, stop).await
    }

    fn routing_pressed(&self) -> Vec<u8> {
        let mut pressed = Vec::new();
        for index in 0..self.cells {
            if self.routing_accumulated[index / 8] & (1 << (index % 8)) != 0 {
                pressed.push(index as u8);
            }
        }
        pressed
    }

    fn is_repeatable(command: i32) -> bool {
        REPEAT_LIST.contains(&(command & !FLG_REPEAT_DELAY))
    }

    /* Map the accumulated key code plus routing keys to a command. */
    fn interpret(&mut self, code: u32, routing: &[u8], context: CommandContext) -> Option<i32> {
        if code != 0 && !routing.is_empty() {
            if self.ignore_routing {
                return None;
            }
            self.ignore_routing = true;
            if routing.len() == 1 {
                let key = i32::from(routing[0]);
                return Some(match code {
                    KEY_BRIGHT | KEY_BUT3 => BLK_CUTBEGIN + key,
                    KEY_BLEFT | KEY_BUT2 => BLK_CUTRECT + key,
                    KEY_BDOWN | KEY_R2DN => BLK_NXINDENT + key,
                    KEY_BUP | KEY_R2UP => BLK_PRINDENT + key,
                    KEY_CROUND => BLK_SETMARK + key,
                    KEY_BROUND | KEY_CNCV => BLK_GOTOMARK + key,
                    KEY_CUP => BLK_SETLEFT + key,
                    KEY_CDOWN => BLK_SWITCHVT + key,
                    c if c == KEY_CUP | KEY_CDOWN => BLK_DESCCHAR + key,
                    c if c == KEY_CDOWN | KEY_BUP => BLK_DESCCHAR + key,
                    _ => return None,
                });
            }
            if routing.len() == 2 {
                if routing[0] + 1 == routing[1] && (code == KEY_BRIGHT || code == KEY_BUT3) {
                    return Some(BLK_CUTAPPEND + i32::from(routing[0]));
                }
                if routing[0] + 1 == routing[1] && (code == KEY_BLEFT || code == KEY_BUT2) {
                    return Some(BLK_CUTLINE + i32::from(routing[1]));
                }
                let positions = (routing[0], routing[1]);
                return Some(match positions {
                    (0, 1) => match code {
                        KEY_BDOWN | KEY_R2DN => CMD_NXPGRPH,
                        KEY_BUP | KEY_R2UP => CMD_PRPGRPH,
                        _ => return None,
                    },
                    (1, 2) => match code {
                        KEY_BDOWN => CMD_NXPROMPT,
                        KEY_BUP => CMD_PRPROMPT,
                        _ => return None,
                    },
                    (0, 2) => match code {
                        KEY_BDOWN | KEY_R2DN => CMD_NXSEARCH,
                        KEY_BUP | KEY_R2UP => CMD_PRSEARCH,
                        _ => return None,
                    },
                    _ => return None,
                });
            }
            return None;
        }

        if !routing.is_empty() {
            let last = self.last_routing_key;
            return Some(match routing {
                [key] => BLK_ROUTE + i32::from(*key),
                [1, 2] => CMD_PASTE,
                [0, 1] => CMD_CHRLT,
                [a, b] if *a == last - 1 && *b == last => CMD_CHRRT,
                [0, 2] => CMD_HWINLT,
                [a, b] if *a == last - 2 && *b == last => CMD_HWINRT,
                [0, b] if *b == last => CMD_HELP,
                [0, 1, c, d] if *c == last - 1 && *d == last => CMD_LEARN,
                [a, b, c] if *a + 2 == *b => {
                    self.pending_command = Some(BLK_CUTRECT + i32::from(*c));
                    BLK_CUTBEGIN + i32::from(*a)
                }
                _ => return None,
            });
        }

        Some(match code {
            c if c == KEY_BUP || c == KEY_BAR1 || c == KEY_R2UP => CMD_LNUP,
            c if c == KEY_BDOWN || c == KEY_BAR2 || c == KEY_BAR3 || c == KEY_BAR4
                || c == KEY_R2DN => CMD_LNDN,
            c if c == KEY_BLEFT || c == KEY_BUT3 => CMD_FWINLT,
            c if c == KEY_BRIGHT || c == KEY_BUT4 => CMD_FWINRT,
            c if c == KEY_BROUND || c == KEY_CNCV => CMD_HOME,
            c if c == KEY_BROUND | KEY_CUP || c == KEY_CNCV | KEY_CUP => CMD_BACK,
            KEY_CROUND => {
                if context == CommandContext::Prefs {
                    CMD_MENU_PREV_SETTING
                } else {
                    CMD_CSRTRK
                }
            }
            c if c == KEY_BLEFT | KEY_BUP || c == KEY_BUT1 | KEY_BAR1 => CMD_TOP_LEFT,
            c if c == KEY_BLEFT | KEY_BDOWN || c == KEY_BUT1 | KEY_BAR2 => CMD_BOT_LEFT,
            c if c == KEY_BROUND | KEY_BUP || c == KEY_BUT2 | KEY_BAR1 => CMD_PRDIFLN,
            c if c == KEY_BROUND | KEY_BDOWN || c == KEY_BUT2 | KEY_BAR2 => CMD_NXDIFLN,
            c if c == KEY_CROUND | KEY_BUP || c == KEY_BUT2 | KEY_R2UP => CMD_ATTRUP,
            c if c == KEY_CROUND | KEY_BDOWN || c == KEY_BUT2 | KEY_R2DN => CMD_ATTRDN,
            c if c == KEY_CLEFT | KEY_CROUND => CMD_CHRLT,
            c if c == KEY_CRIGHT | KEY_CROUND => CMD_CHRRT,
            c if c == KEY_CLEFT | KEY_CUP => CMD_HWINLT,
            c if c == KEY_CRIGHT | KEY_CUP => CMD_HWINRT,
            c if c == KEY_CROUND | KEY_CUP || c == KEY_BUT1 | KEY_BUT2 | KEY_BAR1 => CMD_WINUP,
            c if c == KEY_CROUND | KEY_CDOWN || c == KEY_BUT1 | KEY_BUT2 | KEY_BAR2 => {
                CMD_WINDN
            }
            c if c == KEY_CUP | KEY_BLEFT || c == KEY_R1UP | KEY_BUT3 => CMD_LNBEG,
            c if c == KEY_CUP | KEY_BRIGHT || c == KEY_R1UP | KEY_BUT4 => CMD_LNEND,
            KEY_CLEFT => BLK_PASSKEY + KEY_CURSOR_LEFT,
            KEY_CRIGHT => BLK_PASSKEY + KEY_CURSOR_RIGHT,
            KEY_CUP => {
                if context == CommandContext::Prefs
                    && self.display_type == DisplayType::PowerBraille40
                {
                    CMD_MENU_PREV_SETTING
                } else {
                    BLK_PASSKEY + KEY_CURSOR_UP
                }
            }
            KEY_CDOWN => {
                if context == CommandContext::Prefs
                    && self.display_type == DisplayType::PowerBraille40
                {
                    CMD_MENU_NEXT_SETTING
                } else {
                    BLK_PASSKEY + KEY_CURSOR_DOWN
                }
            }
            c if c == KEY_CLEFT | KEY_CRIGHT => CMD_HELP,
            c if c == KEY_CLEFT | KEY_CRIGHT | KEY_CUP | KEY_CDOWN
                || c == KEY_BUT1 | KEY_BUT2 | KEY_BUT3 | KEY_BUT4 => CMD_LEARN,
            c if c == KEY_CROUND | KEY_BROUND => CMD_FREEZE,
            c if c == KEY_BUP | KEY_BDOWN || c == KEY_CUP | KEY_BDOWN
                || c == KEY_BUT3 | KEY_BUT4 => CMD_INFO,
            c if c == KEY_CUP | KEY_CDOWN || c == KEY_CDOWN | KEY_BUP => CMD_ATTRVIS,
            c if c == KEY_CUP | KEY_CDOWN | KEY_CROUND
                || c == KEY_CDOWN | KEY_BUP | KEY_CROUND => CMD_DISPMD,
            c if c == KEY_CDOWN | KEY_BDOWN || c == KEY_R1DN | KEY_R2DN => CMD_CSRJMP_VERT,
            c if c == KEY_CDOWN | KEY_BDOWN | KEY_BLEFT => BLK_ROUTE,
            c if c == KEY_CDOWN | KEY_BDOWN | KEY_BRIGHT => {
                BLK_ROUTE + 3 * self.columns as i32 / 4 - 1
            }
            c if c == KEY_CLEFT | KEY_BROUND => BLK_CUTBEGIN,
            c if c == KEY_CLEFT | KEY_BROUND | KEY_BUP => BLK_CUTAPPEND,
            c if c == KEY_CRIGHT | KEY_BROUND => BLK_CUTRECT + self.columns as i32 - 1,
            c if c == KEY_CRIGHT | KEY_BROUND | KEY_BUP => {
                BLK_CUTLINE + self.columns as i32 - 1
            }
            c if c == KEY_CDOWN | KEY_BROUND => CMD_PASTE,
            c if c == KEY_CRIGHT | KEY_BLEFT || c == KEY_BAR2 | KEY_R2DN
                || c == KEY_BRIGHT | KEY_BDOWN => CMD_SAY_LINE,
            c if c == KEY_BAR1 | KEY_BAR2 | KEY_R2DN
                || c == KEY_BLEFT | KEY_BRIGHT | KEY_BDOWN => CMD_SAY_BELOW,
            c if c == KEY_BROUND | KEY_BAR2 || c == KEY_BROUND | KEY_BRIGHT => CMD_SPKHOME,
            _ => return None,
        })
    }

    /* Cursor-select: consume one command while the mode is active. */
    async fn drive_cursor_select(
        &mut self,
        port: &mut Port,
        command: i32,
    ) -> Result<Option<i32>> {
        let Some(mut state) = self.cursor_select else {
            return Ok(None);
        };

        let block = command & MSK_BLK;
        let finished = match block {
            BLK_CUTBEGIN => Some(BLK_CUTBEGIN + state.position),
            BLK_CUTAPPEND => Some(BLK_CUTAPPEND + state.position),
            BLK_CUTRECT => {
                self.cursor_memory = -1;
                Some(BLK_CUTRECT + state.position)
            }
            BLK_CUTLINE => {
                self.cursor_memory = -1;
                Some(BLK_CUTLINE + state.position)
            }
            _ => None,
        };
        if let Some(result) = finished {
            self.cursor_select = None;
            self.send_all(port).await?;
            return Ok(Some(result));
        }

        match command & !FLG_REPEAT_DELAY {
            CMD_FWINRT => state.position += 1,
            CMD_FWINLT => state.position -= 1,
            CMD_LNUP => state.position += 5,
            CMD_LNDN => state.position -= 5,
            c if c == BLK_PASSKEY + KEY_CURSOR_RIGHT => {
                state.position = self.columns as i32 - 1;
            }
            c if c == BLK_PASSKEY + KEY_CURSOR_LEFT => state.position = 0,
            c if c == BLK_PASSKEY + KEY_CURSOR_UP => state.position += 10,
            c if c == BLK_PASSKEY + KEY_CURSOR_DOWN => state.position -= 10,
            _ => {}
        }
        state.position = state.position.clamp(0, self.columns as i32 - 1);
        self.cursor_memory = state.position;
        self.cursor_select = Some(state);
        self.show_cursor(port, state.position).await?;
        Ok(Some(CMD_NOOP))
    }

    async fn enter_cursor_select(&mut self, port: &mut Port) -> Result<()> {
        let position = if self.cursor_memory >= 0 {
            self.cursor_memory
        } else {
            0
        };
        self.cursor_select = Some(CursorSelect { position });
        self.cursor_memory = position;
        self.show_cursor(port, position).await
    }

    async fn show_cursor(&mut self, port: &mut Port, position: i32) -> Result<()> {
        let index = position as usize;
        let saved = self.display_buffer[index];
        self.display_buffer[index] |= CUT_CURSOR_CHAR;
        let result = self.send_all(port).await;
        self.display_buffer[index] = saved;
        result
    }

    /* Read the remaining bytes of one input sequence and classify it. */
    async fn read_key_code(&mut self, port: &mut Port, first: u8) -> Result<Option<u32>> {
        enum PacketKind {
            Special,
            Navigator,
            PowerBraille,
        }

        let kind = if first == BATTERY_H1 {
            PacketKind::Special
        } else if first & KEY_SIGMASK == NAV_KEY_DESCRIPTION[0].signature {
            PacketKind::Navigator
        } else if first & KEY_SIGMASK == PB_KEY_DESCRIPTION[0].signature {
            PacketKind::PowerBraille
        } else {
            return Ok(None);
        };

        match kind {
            PacketKind::Special => {
                let Some(second) = read_byte(port, true).await? else {
                    return Ok(None);
                };
                match second {
                    BATTERY_H2 => {
                        warn!("Display battery is low");
                        Ok(None)
                    }
                    KEY_SW_H2 => self.read_routing_sequence(port).await,
                    byte if byte == Q_HEADER[1] => {
                        /* Reply to an idle ping; drop the rest. */
                        debug!("Got reply to idle ping");
                        let mut rest = [0u8; Q_REPLY_LENGTH - 2];
                        let _ = port.read_bytes(&mut rest, true).await?;
                        Ok(None)
                    }
                    _ => Ok(None),
                }
            }
            PacketKind::Navigator => {
                let Some(second) = read_byte(port, true).await? else {
                    return Ok(None);
                };
                if second & KEY_SIGMASK != NAV_KEY_DESCRIPTION[1].signature {
                    return Ok(None);
                }
                let mut code = 0u32;
                for (byte, description) in [first, second].iter().zip(&NAV_KEY_DESCRIPTION) {
                    code |= u32::from(byte & description.mask) << description.shift;
                }
                Ok(Some(code))
            }
            PacketKind::PowerBraille => {
                let mut bytes = [first, 0, 0, 0, 0, 0];
                for index in 1..PB_KEY_DESCRIPTION.len() {
                    let Some(byte) = read_byte(port, true).await? else {
                        return Ok(None);
                    };
                    if byte & KEY_SIGMASK != PB_KEY_DESCRIPTION[index].signature {
                        return Ok(None);
                    }
                    bytes[index] = byte;
                }
                let mut code = 0u32;
                for (byte, description) in bytes.iter().zip(&PB_KEY_DESCRIPTION) {
                    code |= u32::from(byte & description.mask) << description.shift;
                }
                Ok(Some(code))
            }
        }
    }

    /* Routing sensors: the display repeats the bitmap every half second
     * while keys are held and sends an all-zero bitmap on release. The
     * pressed set accumulates until that release. */
    async fn read_routing_sequence(&mut self, port: &mut Port) -> Result<Option<u32>> {
        let Some(count) = read_byte(port, true).await? else {
            return Ok(None);
        };
        if count != self.routing_byte_count {
            return Ok(None);
        }

        let mut vertical = [0u8; SW_NVERT];
        if port.read_bytes(&mut vertical, true).await? != SW_NVERT {
            return Ok(None);
        }
        let horizontal_count = usize::from(count) - SW_NVERT;
        let mut horizontal = [0u8; SW_MAXHORIZ];
        if port.read_bytes(&mut horizontal[..horizontal_count], true).await? != horizontal_count
        {
            return Ok(None);
        }

        if !self.routing_live {
            self.routing_live = true;
            self.ignore_routing = false;
            self.routing_accumulated = [0; SW_MAXHORIZ];
        }
        for (accumulated, new) in self
            .routing_accumulated
            .iter_mut()
            .zip(&horizontal[..horizontal_count])
        {
            *accumulated |= *new;
        }

        if horizontal[..horizontal_count].iter().any(|byte| *byte != 0) {
            /* Still held; wait for the release bitmap. */
            return Ok(None);
        }
        self.routing_live = false;
        if self.ignore_routing {
            self.routing_accumulated = [0; SW_MAXHORIZ];
            return Ok(None);
        }
        Ok(Some(0))
    }
}

#[async_trait]
impl ProtocolDriver for TsiDriver {
    fn name(&self) -> &'static str {
        "TSI"
    }

    async fn open(&mut self, port: &mut Port, _parameters: &Parameters) -> Result<Geometry> {
        debug!("Sending query at 9600bps");
        port.configure_serial(&SerialConfig::new(9600, SerialParity::None)).await?;
        let Some(reply) = self.query_display(port).await? else {
            return Err(BrailleError::ProbeFailed { driver: self.name() });
        };

        self.cells = usize::from(reply[Q_OFFSET_COLS]);
        self.version =
            String::from_utf8_lossy(&reply[Q_OFFSET_VERSION..Q_OFFSET_VERSION + 4]).to_string();
        info!("Display replied: {} cells, version {}", self.cells, self.version);

        self.columns = self.cells;
        self.last_routing_key = self.cells as u8 - 1;
        self.full_freshen_every = FULL_FRESHEN_EVERY;
        let mut fast = false;

        match self.cells {
            20 => {
                self.display_type = DisplayType::Navigator2040;
                self.has_routing = false;
                info!("Detected Navigator 20");
            }
            40 => {
                if self.version.as_bytes().get(1).copied().unwrap_or(b'0') > b'3' {
                    self.display_type = DisplayType::PowerBraille40;
                    self.has_routing = true;
                    self.routing_byte_count = SW_CNT40;
                    self.last_routing_key = 39;
                    fast = true;
                    info!("Detected PowerBraille 40");
                } else {
                    self.display_type = DisplayType::Navigator2040;
                    self.has_routing = false;
                    info!("Detected Navigator 40");
                }
            }
            80 => {
                self.display_type = DisplayType::Navigator80;
                self.has_routing = true;
                self.routing_byte_count = SW_CNT80;
                self.last_routing_key = 79;
                info!("Detected Navigator 80");
            }
            65 => {
                self.display_type = DisplayType::PowerBraille6580;
                self.has_routing = true;
                self.routing_byte_count = SW_CNT81;
                self.last_routing_key = 64;
                fast = true;
                info!("Detected PowerBraille 65");
            }
            81 => {
                self.display_type = DisplayType::PowerBraille6580;
                self.has_routing = true;
                self.routing_byte_count = SW_CNT81;
                self.last_routing_key = 79;
                self.columns = 80;
                fast = true;
                info!("Detected PowerBraille 80");
            }
            _ => {
                warn!("Unrecognized braille display");
                return Err(BrailleError::ProbeFailed { driver: self.name() });
            }
        }

        if fast {
            /* Offer 19200; a TSI emulator stays behind at 9600 and needs
             * a full refresh on every write. */
            port.write_bytes(&BRL_UART192).await?;
            port.drain_output().await?;
            port.configure_serial(&SerialConfig::new(19200, SerialParity::None)).await?;
            debug!("Switched to 19200bps. Checking if display followed.");
            if self.query_display(port).await?.is_none() {
                info!("Display did not respond at 19200bps, falling back to 9600bps.");
                port.configure_serial(&SerialConfig::new(9600, SerialParity::None)).await?;
                if self.query_display(port).await?.is_some() {
                    info!("Found display again at 9600bps. Must be a TSI emulator.");
                    self.full_freshen_every = 1;
                } else {
                    warn!("Display lost after baud switching");
                    return Err(BrailleError::ProbeFailed { driver: self.name() });
                }
            }
        }

        self.last_ping = Instant::now();
        self.last_ping_sent = self.last_ping;
        self.pings = 0;
        self.routing_live = false;
        self.ignore_routing = false;
        self.pending_command = None;
        self.cursor_select = None;
        self.cursor_memory = -1;
        self.last_command = CMD_NOOP;

        self.reset_typematic(port).await?;

        self.display_buffer = vec![0; self.cells];
        /* Force a rewrite on the first write_window. */
        self.previous_cells = vec![0xFF; self.cells];
        self.write_count = 0;

        Ok(self.geometry())
    }

    fn geometry(&self) -> Geometry {
        let mut geometry = Geometry::new(self.columns, self.cells - self.columns);
        geometry.help_page = match self.display_type {
            DisplayType::Navigator2040 => 0,
            DisplayType::Navigator80 => 1,
            DisplayType::PowerBraille40 => 2,
            DisplayType::PowerBraille6580 => 3,
        };
        geometry
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.columns.min(cells.len());
        self.display_buffer[..count].copy_from_slice(&cells[..count]);

        self.write_count -= 1;
        if self.write_count <= 0 {
            /* Full update every nth window to clear any garble. */
            self.write_count = self.full_freshen_every;
            self.previous_cells.copy_from_slice(&self.display_buffer);
            self.send_all(port).await?;
        } else if let Some((start, stop)) =
            diff_range(&self.previous_cells, &self.display_buffer)
        {
            self.previous_cells[start..=stop]
                .copy_from_slice(&self.display_buffer[start..=stop]);
            self.send_range(port, start, stop).await?;
        }
        Ok(())
    }

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let _ = port;
        /* Only the 81-cell PowerBraille has a status cell, the last one. */
        if self.cells == 81 {
            if let Some(cell) = cells.first() {
                self.display_buffer[80] = *cell;
            }
        }
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        context: CommandContext,
    ) -> Result<ReadResult> {
        if let Some(command) = self.pending_command.take() {
            self.last_command = CMD_NOOP;
            return Ok(ReadResult::Command(command));
        }

        let Some(first) = read_byte(port, false).await? else {
            /* Idle: ping the display to notice a power-off. */
            if self.last_ping.elapsed() > PING_INTERVAL {
                let ping_due = self.pings == 0
                    || self.last_ping_sent.elapsed() > PING_REPLY_DELAY;
                if self.pings >= PING_MAXNQUERY && ping_due {
                    return Ok(ReadResult::Restart);
                }
                if ping_due {
                    debug!("Display idle: sending query");
                    port.drain_output().await?;
                    port.write_bytes(&BRL_QUERY).await?;
                    port.credit_write_delay(BRL_QUERY.len());
                    self.pings += 1;
                    self.last_ping_sent = Instant::now();
                }
            }
            return Ok(ReadResult::None);
        };
        self.last_ping = Instant::now();
        self.pings = 0;

        let Some(code) = self.read_key_code(port, first).await? else {
            return Ok(ReadResult::None);
        };

        let routing = if self.has_routing {
            self.routing_pressed()
        } else {
            Vec::new()
        };
        if code == 0 && routing.is_empty() {
            return Ok(ReadResult::None);
        }

        /* Cursor-select entry chord. */
        if code == KEY_CLEFT | KEY_CRIGHT | KEY_BROUND {
            if self.cursor_select.is_some() {
                /* Pressed again: cancel the mode. */
                self.cursor_select = None;
                self.send_all(port).await?;
                return Ok(ReadResult::Command(CMD_NOOP));
            }
            self.enter_cursor_select(port).await?;
            return Ok(ReadResult::Command(CMD_NOOP));
        }

        let command = self.interpret(code, &routing, context);
        if !routing.is_empty() && !self.routing_live {
            self.routing_accumulated = [0; SW_MAXHORIZ];
        }
        let Some(command) = command else {
            return Ok(ReadResult::None);
        };

        if self.cursor_select.is_some() {
            if let Some(result) = self.drive_cursor_select(port, command).await? {
                return Ok(ReadResult::Command(result));
            }
        }

        /* Suppress accidental typematic repetition of one-shot keys. */
        if command == self.last_command
            && !Self::is_repeatable(command)
            && self.last_command_time.elapsed() < NONREPEAT_TIMEOUT
        {
            self.last_command_time = Instant::now();
            return Ok(ReadResult::None);
        }
        self.last_command = command;
        self.last_command_time = Instant::now();
        Ok(ReadResult::Command(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_reply(cells: u8, version: &[u8; 4]) -> Vec<u8> {
        let mut reply = vec![Q_HEADER[0], Q_HEADER[1], cells, 0];
        reply.extend_from_slice(version);
        reply.extend_from_slice(&[0, 0, 0, 0]);
        reply
    }

    async fn open_nav_40() -> (TsiDriver, Port) {
        let mut driver = TsiDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(&BRL_QUERY, &query_reply(40, b"v3.0"));
        let geometry = driver
            .open(&mut port, &Parameters::empty())
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 40);
        port.mock_mut().take_output();
        (driver, port)
    }

    async fn open_pb_80() -> (TsiDriver, Port) {
        let mut driver = TsiDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(&BRL_QUERY, &query_reply(81, b"v4.1"));
        /* The display follows to 19200 and answers the second query. */
        port.mock_mut().reply_on_write(&BRL_QUERY, &query_reply(81, b"v4.1"));
        let geometry = driver
            .open(&mut port, &Parameters::empty())
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 80);
        assert_eq!(geometry.status_columns, 1);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_detects_navigator_40() {
        let (driver, _port) = open_nav_40().await;
        assert_eq!(driver.display_type, DisplayType::Navigator2040);
        assert!(!driver.has_routing);
    }

    #[tokio::test]
    async fn test_open_detects_powerbraille_80() {
        let (driver, _port) = open_pb_80().await;
        assert_eq!(driver.display_type, DisplayType::PowerBraille6580);
        assert!(driver.has_routing);
    }

    #[tokio::test]
    async fn test_emulator_fallback_freshens_every_write() {
        let mut driver = TsiDriver::new();
        let mut port = Port::mock();
        /* Answers once at 9600 as a PB40, then never again at 19200,
         * then again at 9600. */
        port.mock_mut().reply_on_write(&BRL_QUERY, &query_reply(40, b"v4.0"));
        port.mock_mut().reply_on_write(&BRL_UART192, &[]);
        port.mock_mut().reply_on_write(&BRL_QUERY, &[]);
        port.mock_mut().reply_on_write(&BRL_QUERY, &query_reply(40, b"v4.0"));
        driver.open(&mut port, &Parameters::empty()).await.unwrap();
        assert_eq!(driver.full_freshen_every, 1);
    }

    #[tokio::test]
    async fn test_first_write_sends_full_frame() {
        let (mut driver, mut port) = open_nav_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(&output[..6], &BRL_SEND_HEAD);
        assert_eq!(output[6], 80); /* 2 * 40 pairs */
        assert_eq!(output[7], 0);
        assert_eq!(output.len(), 8 + 80);
    }

    #[tokio::test]
    async fn test_diff_range_frame() {
        let (mut driver, mut port) = open_nav_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().take_output();

        let mut cells = [0u8; 40];
        cells[20] = 0xFF;
        driver.write_window(&mut port, &cells).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[6], 2); /* one pair */
        assert_eq!(output[7], 20); /* at offset 20 */
        assert_eq!(output.len(), 8 + 2);
    }

    #[tokio::test]
    async fn test_unchanged_window_is_silent() {
        let (mut driver, mut port) = open_nav_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().take_output();
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());
    }

    #[tokio::test]
    async fn test_count_based_forced_refresh() {
        let (mut driver, mut port) = open_nav_40().await;
        for _ in 0..FULL_FRESHEN_EVERY {
            driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        }
        port.mock_mut().take_output();

        /* The 13th write re-sends everything although nothing changed. */
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        let output = port.mock_mut().take_output();
        assert_eq!(output[6], 80);
        assert_eq!(output.len(), 8 + 80);
    }

    #[tokio::test]
    async fn test_navigator_key_chord() {
        let (mut driver, mut port) = open_nav_40().await;
        /* BUP: byte 1 sig 0x60 with bit 1; byte 2 sig 0xE0 empty. */
        port.mock_mut().push_input(&[0x60 | 0x02, 0xE0]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_LNUP));
    }

    #[tokio::test]
    async fn test_routing_key_sequence() {
        let (mut driver, mut port) = open_pb_80().await;

        /* Key 5 held: bitmap with bit 5, then the all-zero release. */
        let mut held = vec![BATTERY_H1, KEY_SW_H2, SW_CNT81];
        held.extend_from_slice(&[0; SW_NVERT]);
        let mut horizontal = [0u8; SW_CNT81 as usize - SW_NVERT];
        horizontal[0] = 1 << 5;
        held.extend_from_slice(&horizontal);
        port.mock_mut().push_input(&held);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::None);

        let mut release = vec![BATTERY_H1, KEY_SW_H2, SW_CNT81];
        release.extend_from_slice(&[0; SW_NVERT]);
        release.extend_from_slice(&[0u8; SW_CNT81 as usize - SW_NVERT]);
        port.mock_mut().push_input(&release);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ping_then_restart() {
        let (mut driver, mut port) = open_nav_40().await;

        /* First idle period: one ping goes out. */
        tokio::time::advance(PING_INTERVAL + Duration::from_millis(100)).await;
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::None);
        assert_eq!(port.mock_mut().take_output(), BRL_QUERY.to_vec());

        /* Second unanswered ping. */
        tokio::time::advance(PING_REPLY_DELAY + Duration::from_millis(50)).await;
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::None);

        /* Both pings unanswered: give up. */
        tokio::time::advance(PING_REPLY_DELAY + Duration::from_millis(50)).await;
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Restart);
    }

    #[tokio::test]
    async fn test_cursor_select_mode() {
        let (mut driver, mut port) = open_nav_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        port.mock_mut().take_output();

        /* CLEFT+CRIGHT+BROUND enters the mode. */
        let entry_low = 0x60 | 0x10; /* BROUND */
        let entry_high = 0xE0 | 0x01 | 0x04; /* CLEFT, CRIGHT */
        port.mock_mut().push_input(&[entry_low, entry_high]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));
        assert!(driver.cursor_select.is_some());

        /* BRIGHT moves the cursor right by one. */
        port.mock_mut().push_input(&[0x60 | 0x04, 0xE0]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));

        /* CLEFT+BROUND finishes with cut-begin at the position. */
        port.mock_mut().push_input(&[0x60 | 0x10, 0xE0 | 0x01]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_CUTBEGIN + 1));
        assert!(driver.cursor_select.is_none());
    }
}
