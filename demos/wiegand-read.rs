// Read access cards from both Wiegand interfaces at once.
//
// This example illustrates:
//
// - Sharing one IonoPi between threads.
// - Running a blocking Wiegand monitor on each interface.
// - Decoding standard 26-bit and 34-bit card formats.
// - Stopping a monitor from another thread.
//
// USAGE:
//
// Connect readers to TTL1/TTL2 (interface 1) and TTL3/TTL4 (interface 2) and present
// cards. The LED lights while a card is being reported. Presenting the same card
// three times in a row quits.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::Result;
use log::{info, warn};
use rppal_ionopi::{Frame, IonoPi, Level, Output, WiegandInterface};

fn describe(frame: &Frame) -> String {
    match frame.bit_count {
        26 => frame.decode_h10301().map_or_else(
            || "bad parity".to_string(),
            |c| format!("facility {} card {}", c.facility, c.card),
        ),
        34 => frame.decode_34().map_or_else(
            || "bad parity".to_string(),
            |c| format!("facility {} card {}", c.facility, c.card),
        ),
        _ => format!("{:#x}", frame.data),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    info!("Wiegand reader started!");

    let iono = IonoPi::new()?;
    iono.set_wiegand_pulse(150, 500, 2_700)?;

    let last_seen = Arc::new(Mutex::new((None, 0)));

    thread::scope(|s| {
        let readers: Vec<_> = [WiegandInterface::W1, WiegandInterface::W2]
            .into_iter()
            .map(|interface| {
                let iono = &iono;
                let last_seen = last_seen.clone();
                s.spawn(move || {
                    iono.wiegand_monitor(interface, |interface, frame| {
                        let _ = iono.digital_write(Output::Led, Level::High);
                        println!("W{interface}: {} bits, {}", frame.bit_count, describe(&frame));
                        thread::sleep(Duration::from_millis(100));
                        let _ = iono.digital_write(Output::Led, Level::Low);

                        let mut last_seen = last_seen.lock().unwrap_or_else(|e| e.into_inner());
                        if last_seen.0 == Some(frame) {
                            last_seen.1 += 1;
                        } else {
                            *last_seen = (Some(frame), 1);
                        }
                        if last_seen.1 >= 3 {
                            println!("Same card three times: quitting");
                            let other = match interface {
                                WiegandInterface::W1 => WiegandInterface::W2,
                                WiegandInterface::W2 => WiegandInterface::W1,
                            };
                            iono.wiegand_stop(other);
                            return false;
                        }
                        true
                    })
                })
            })
            .collect();

        for reader in readers {
            match reader.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("Wiegand monitor failed: {e}"),
                Err(_) => warn!("Wiegand monitor panicked"),
            }
        }
    });

    println!("\nReading is done!\n");
    Ok(())
}
