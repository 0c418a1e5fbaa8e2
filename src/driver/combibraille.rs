/* Tieman CombiBraille driver (serial only). */
/*  */
/* The display answers an `ESC ?` probe with the same sequence plus a   */
/* model id byte. Data frames are `ESC B`, five status cells, then the  */
/* window, with any 0x1B payload byte doubled. Key events come in as    */
/* `ESC K` / `ESC C` sequences. */

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Geometry, ProtocolDriver, read_byte};
use crate::cells::{DotsTable, OutputTable};
use crate::command::*;
use crate::error::{BrailleError, Result};
use crate::parameters::Parameters;
use crate::transport::{FlowControl, Port, SerialConfig, SerialParity};

const SERIAL_CONFIG: SerialConfig = SerialConfig::new(38400, SerialParity::None);

const DOTS_TIEMAN: DotsTable = [0x01, 0x02, 0x04, 0x80, 0x40, 0x20, 0x08, 0x10];

const ESC: u8 = 0x1B;
const INIT_SEQ: [u8; 2] = [ESC, b'?'];
const PRE_DATA: [u8; 2] = [ESC, b'B'];
const STATUS_CELLS: usize = 5;

const ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/* Thumb key bits reported by `ESC K`. */
const KEY_T1: u8 = 0x01;
const KEY_T2: u8 = 0x02;
const KEY_T3: u8 = 0x04;
const KEY_T4: u8 = 0x08;
const KEY_T5: u8 = 0x10;

fn columns_for_model(id: u8) -> Option<usize> {
    match id {
        0 | 7 => Some(20),
        1 | 8 => Some(40),
        2 | 9 => Some(80),
        _ => None,
    }
}

pub struct CombiBrailleDriver {
    output_table: OutputTable,
    columns: usize,
    previous_cells: Vec<u8>,
    status_cells: [u8; STATUS_CELLS],
    previous_status: [u8; STATUS_CELLS],

    /* Cut function armed for the next routing key. */
    routing_operation: Option<i32>,

    /* ESC K / ESC C reassembly. */
    key_queue: Vec<u8>,
}

impl CombiBrailleDriver {
    pub fn new() -> Self {
        Self {
            output_table: OutputTable::build(&DOTS_TIEMAN),
            columns: 0,
            previous_cells: Vec::new(),
            status_cells: [0; STATUS_CELLS],
            previous_status: [0; STATUS_CELLS],
            routing_operation: None,
            key_queue: Vec::new(),
        }
    }

    /* One data frame carries the status cells and the whole window,
     * dot-mapped, with 0x1B bytes doubled. */
    async fn write_cells(&mut self, port: &mut Port, window: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(PRE_DATA.len() + (STATUS_CELLS + window.len()) * 2);
        frame.extend_from_slice(&PRE_DATA);
        for cell in self.status_cells {
            frame.push(cell);
            if cell == ESC {
                frame.push(ESC);
            }
        }
        for cell in window {
            let cell = self.output_table.translate(*cell);
            frame.push(cell);
            if cell == ESC {
                frame.push(ESC);
            }
        }
        port.write_bytes(&frame).await?;
        port.credit_write_delay(frame.len());
        Ok(())
    }

    /* Pull one key code out of the byte stream: `ESC K a [b]` for thumb
     * and dot keys, `ESC C n` for routing keys. */
    async fn next_key(&mut self, port: &mut Port) -> Result<Option<i32>> {
        while let Some(byte) = read_byte(port, false).await? {
            match self.key_queue.len() {
                0 => {
                    if byte != ESC {
                        continue;
                    }
                    self.key_queue.push(byte);
                }
                1 => {
                    if byte != b'K' && byte != b'C' {
                        self.key_queue.clear();
                        continue;
                    }
                    self.key_queue.push(byte);
                }
                2 => {
                    if self.key_queue[1] == b'K' && byte == 0 {
                        /* Extended thumb code follows in a fourth byte. */
                        self.key_queue.push(byte);
                        continue;
                    }
                    let code = if self.key_queue[1] == b'K' {
                        i32::from(byte)
                    } else {
                        i32::from(byte) | 0x80
                    };
                    self.key_queue.clear();
                    return Ok(Some(code));
                }
                _ => {
                    let code = i32::from(byte) | 0x60;
                    self.key_queue.clear();
                    return Ok(Some(code));
                }
            }
        }
        Ok(None)
    }

    fn interpret_key(&mut self, code: i32) -> i32 {
        /* Routing keys carry the armed cut function, if any. */
        if code & 0x80 != 0 {
            let key = (code & 0x7F) as usize;
            if key >= self.columns {
                warn!("Unexpected routing key: {key}");
                return CMD_NOOP;
            }
            let base = self.routing_operation.take().unwrap_or(BLK_ROUTE);
            return base + key as i32;
        }
        self.routing_operation = None;

        match code as u8 {
            KEY_T1 => CMD_FWINLT,
            KEY_T2 => CMD_LNUP,
            KEY_T3 => CMD_HOME,
            KEY_T4 => CMD_LNDN,
            KEY_T5 => CMD_FWINRT,

            code if code == KEY_T1 | KEY_T2 => CMD_TOP_LEFT,
            code if code == KEY_T4 | KEY_T5 => CMD_BOT_LEFT,
            code if code == KEY_T1 | KEY_T3 => CMD_CHRLT,
            code if code == KEY_T3 | KEY_T5 => CMD_CHRRT,
            code if code == KEY_T2 | KEY_T3 => CMD_CSRTRK,
            code if code == KEY_T3 | KEY_T4 => CMD_CSRVIS,
            code if code == KEY_T1 | KEY_T4 => CMD_DISPMD,
            code if code == KEY_T2 | KEY_T5 => CMD_FREEZE,
            code if code == KEY_T1 | KEY_T5 => CMD_INFO,
            code if code == KEY_T2 | KEY_T4 => CMD_PASTE,
            code if code == KEY_T1 | KEY_T2 | KEY_T3 => CMD_PREFMENU,
            code if code == KEY_T3 | KEY_T4 | KEY_T5 => CMD_HELP,
            code if code == KEY_T2 | KEY_T3 | KEY_T4 => CMD_LEARN,

            /* Thumb chords arming the cut operations on the next
             * routing key. */
            code if code == KEY_T1 | KEY_T2 | KEY_T4 => {
                self.routing_operation = Some(BLK_CUTBEGIN);
                CMD_NOOP
            }
            code if code == KEY_T1 | KEY_T2 | KEY_T5 => {
                self.routing_operation = Some(BLK_CUTAPPEND);
                CMD_NOOP
            }
            code if code == KEY_T2 | KEY_T4 | KEY_T5 => {
                self.routing_operation = Some(BLK_CUTLINE);
                CMD_NOOP
            }
            code if code == KEY_T1 | KEY_T4 | KEY_T5 => {
                self.routing_operation = Some(BLK_CUTRECT);
                CMD_NOOP
            }

            /* Extended codes from the four-byte sequence. */
            0x61 => CMD_LNBEG,
            0x62 => CMD_LNEND,
            0x63 => CMD_TOP,
            0x64 => CMD_BOT,
            0x65 => CMD_PRDIFLN,
            0x66 => CMD_NXDIFLN,

            _ => {
                warn!("Unexpected key code: {code:02X}");
                CMD_NOOP
            }
        }
    }
}

#[async_trait]
impl ProtocolDriver for CombiBrailleDriver {
    fn name(&self) -> &'static str {
        "CombiBraille"
    }

    async fn open(&mut self, port: &mut Port, _parameters: &Parameters) -> Result<Geometry> {
        port.configure_serial(&SERIAL_CONFIG).await?;
        port.write_bytes(&INIT_SEQ).await?;
        port.credit_write_delay(INIT_SEQ.len());

        /* The reply echoes the init sequence and appends the model id.
         * Stray bytes before it are skipped. */
        let deadline = Instant::now() + ACK_TIMEOUT;
        let mut matched = 0;
        let id = loop {
            if Instant::now() >= deadline {
                return Err(BrailleError::ProbeFailed { driver: self.name() });
            }
            if !port.await_input(Duration::from_millis(20)).await? {
                continue;
            }
            let Some(byte) = read_byte(port, false).await? else {
                continue;
            };
            if matched < INIT_SEQ.len() {
                if byte == INIT_SEQ[matched] {
                    matched += 1;
                }
                continue;
            }
            break byte;
        };

        let Some(columns) = columns_for_model(id) else {
            warn!("Detected unknown CombiBraille model: {id:02X}");
            return Err(BrailleError::IdentityMismatch { identity: id });
        };
        info!("Detected CombiBraille {columns}");

        port.set_flow_control(FlowControl::Hardware).await?;

        self.columns = columns;
        self.previous_cells = vec![0; columns];
        self.status_cells = [0; STATUS_CELLS];
        self.previous_status = [0; STATUS_CELLS];
        self.routing_operation = None;
        self.key_queue.clear();

        let window = vec![0; columns];
        self.write_cells(port, &window).await?;
        Ok(self.geometry())
    }

    async fn close(&mut self, port: &mut Port) {
        /* Clear the status cells and the display on the way out. */
        let window = vec![0; self.columns];
        self.status_cells = [0; STATUS_CELLS];
        let _ = self.write_cells(port, &window).await;
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(self.columns, STATUS_CELLS)
    }

    async fn write_window(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let count = self.columns.min(cells.len());
        if self.previous_cells[..count] != cells[..count]
            || self.status_cells != self.previous_status
        {
            self.previous_cells[..count].copy_from_slice(&cells[..count]);
            self.previous_status = self.status_cells;
            let window = self.previous_cells.clone();
            self.write_cells(port, &window).await?;
        }
        Ok(())
    }

    async fn write_status(&mut self, port: &mut Port, cells: &[u8]) -> Result<()> {
        let _ = port;
        for (status, cell) in self.status_cells.iter_mut().zip(cells) {
            *status = self.output_table.translate(*cell);
        }
        Ok(())
    }

    async fn read_command(
        &mut self,
        port: &mut Port,
        _context: CommandContext,
    ) -> Result<ReadResult> {
        match self.next_key(port).await? {
            Some(code) => {
                debug!("key code: {code:02X}");
                Ok(ReadResult::Command(self.interpret_key(code)))
            }
            None => Ok(ReadResult::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_40() -> (CombiBrailleDriver, Port) {
        let mut driver = CombiBrailleDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(&INIT_SEQ, &[ESC, b'?', 1]);
        let geometry = driver
            .open(&mut port, &Parameters::empty())
            .await
            .unwrap();
        assert_eq!(geometry.text_columns, 40);
        assert_eq!(geometry.status_columns, STATUS_CELLS);
        port.mock_mut().take_output();
        (driver, port)
    }

    #[tokio::test]
    async fn test_open_identifies_model() {
        let (driver, _port) = open_40().await;
        assert_eq!(driver.columns, 40);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_open() {
        let mut driver = CombiBrailleDriver::new();
        let mut port = Port::mock();
        port.mock_mut().reply_on_write(&INIT_SEQ, &[ESC, b'?', 5]);
        let result = driver.open(&mut port, &Parameters::empty()).await;
        assert!(matches!(
            result,
            Err(BrailleError::IdentityMismatch { identity: 5 })
        ));
    }

    #[tokio::test]
    async fn test_escape_cells_doubled() {
        let (mut driver, mut port) = open_40().await;
        let mut cells = [0u8; 40];
        /* Dots 1+2+7+8 map to 0x1B in the Tieman dot order. */
        cells[3] = 0xC3;
        assert_eq!(driver.output_table.translate(cells[3]), ESC);
        driver.write_window(&mut port, &cells).await.unwrap();
        let output = port.mock_mut().take_output();
        let escapes = output.iter().skip(2).filter(|byte| **byte == ESC).count();
        assert_eq!(escapes, 2);
        /* frame = pre-data + 5 status + 40 window + 1 doubled escape */
        assert_eq!(output.len(), 2 + 5 + 40 + 1);
    }

    #[tokio::test]
    async fn test_unchanged_window_writes_nothing() {
        let (mut driver, mut port) = open_40().await;
        driver.write_window(&mut port, &[0u8; 40]).await.unwrap();
        assert!(port.mock_mut().take_output().is_empty());
    }

    #[tokio::test]
    async fn test_thumb_key() {
        let (mut driver, mut port) = open_40().await;
        port.mock_mut().push_input(&[ESC, b'K', KEY_T2]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_LNUP));
    }

    #[tokio::test]
    async fn test_routing_key_with_armed_cut() {
        let (mut driver, mut port) = open_40().await;

        port.mock_mut().push_input(&[ESC, b'K', KEY_T1 | KEY_T2 | KEY_T4]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_NOOP));

        port.mock_mut().push_input(&[ESC, b'C', 9]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_CUTBEGIN + 9));

        /* The armed function is one-shot. */
        port.mock_mut().push_input(&[ESC, b'C', 9]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(BLK_ROUTE + 9));
    }

    #[tokio::test]
    async fn test_extended_key_sequence() {
        let (mut driver, mut port) = open_40().await;
        port.mock_mut().push_input(&[ESC, b'K', 0, 0x03]);
        let result = driver
            .read_command(&mut port, CommandContext::Screen)
            .await
            .unwrap();
        assert_eq!(result, ReadResult::Command(CMD_TOP));
    }
}
