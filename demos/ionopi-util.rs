// Command-line utility for the Iono Pi.
//
// This example illustrates:
//
// - Setting relays, open collectors and the LED.
// - Reading digital inputs once, or following every change with a callback.
// - Reading analog inputs as voltages.
// - Listing and reading 1-Wire temperature sensors.
// - Reading an RHT03 temperature and humidity sensor on a TTL line.
// - Reading a Wiegand interface once or continuously.
//
// USAGE:
//
//   ionopi-util <command>
//
// Run with no arguments for the list of commands. Set RUST_LOG=debug to see what the
// driver is doing.

use std::{env, process::ExitCode, thread};

use anyhow::{Result, bail};
use log::info;
use rppal_ionopi::{AnalogInput, EdgeMode, Input, IonoPi, Level, Output, WiegandInterface};

const USAGE: &str = "\
Commands:
   -v              Print the Iono Pi utility version number
   led on          Turn on the green LED
   led off         Turn off the green LED
   o<n> open       Open relay output o<n> (<n>=1..4)
   o<n> close      Close relay output o<n> (<n>=1..4)
   oc<n> open      Open open collector oc<n> (<n>=1..3)
   oc<n> close     Close open collector oc<n> (<n>=1..3)
   di<n>           Print the state (\"high\" or \"low\") of digital input di<n> (<n>=1..6)
   di<n> -f        Print the state of digital input di<n> now and on every change
   ttl<n>          Print the state of TTL line ttl<n> (<n>=1..4)
   ai<n>           Print the voltage value (V) read from analog input ai<n> (<n>=1..4)
   1wire bus       Print the list of device IDs found on the 1-Wire bus
   1wire bus <id>  Print the temperature value (°C) read from 1-Wire device <id>
   1wire ttl<n>    Print temperature (°C) and humidity (%) values read from the
                   MaxDetect sensor (e.g. RHT03) on TTL line ttl<n> (<n>=1..4)
   wiegand <n>     Wait for data to be available on Wiegand interface <n> (<n>=1|2)
                   and print number of bits and value read
   wiegand <n> -f  Continuously print number of bits and value read from Wiegand
                   interface <n> whenever data is available
";

fn level_name(level: Level) -> &'static str {
    match level {
        Level::High => "high",
        Level::Low => "low",
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("ionopi-util", String::as_str);
    let args: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("usage: {program} <command>\n\n{USAGE}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{program}: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run a command. Returns `Ok(false)` if the command wasn't recognised.
fn run(args: &[&str]) -> Result<bool> {
    let Some(&command) = args.first() else {
        return Ok(false);
    };
    let follow = args.get(1) == Some(&"-f");

    match (command, args.get(1).copied()) {
        ("-v", None) => println!("{}", env!("CARGO_PKG_VERSION")),

        ("1wire", Some("bus")) => {
            let iono = IonoPi::new()?;
            match args.get(2) {
                Some(id) => println!("{:.3}", iono.one_wire_temperature(id, 3)?),
                None => {
                    for id in iono.one_wire_devices()? {
                        println!("{id}");
                    }
                }
            }
        }

        ("1wire", Some(line)) => {
            let Ok(line) = line.parse::<Input>() else {
                return Ok(false);
            };
            if line.wiegand_interface().is_none() {
                return Ok(false);
            }
            let (temperature, humidity) = IonoPi::new()?.max_detect_read(line, 3)?;
            println!("{temperature:.1} {humidity:.1}");
        }

        ("wiegand", Some(n)) => {
            let interface = WiegandInterface::try_from(n.parse::<u8>()?)?;
            let follow = args.get(2) == Some(&"-f");
            let iono = IonoPi::new()?;
            info!("Waiting for Wiegand data on interface {interface}");
            iono.wiegand_monitor(interface, |_, frame| {
                println!("{frame}");
                follow
            })?;
        }

        (name, action) => {
            if let Ok(output) = name.parse::<Output>() {
                let level = match action {
                    Some("on") if output == Output::Led => Level::High,
                    Some("off") if output == Output::Led => Level::Low,
                    Some("close") if output != Output::Led => Level::High,
                    Some("open") if output != Output::Led => Level::Low,
                    _ => return Ok(false),
                };
                IonoPi::new()?.digital_write(output, level)?;
            } else if let Ok(input) = name.parse::<Input>() {
                let iono = IonoPi::new()?;
                println!("{}", level_name(iono.digital_read(input)?));
                if follow {
                    iono.digital_interrupt(
                        input,
                        EdgeMode::Both,
                        Some(Box::new(|_, level| println!("{}", level_name(level)))),
                    )?;
                    loop {
                        thread::park();
                    }
                }
            } else if let Ok(analog) = name.parse::<AnalogInput>() {
                if action.is_some() {
                    bail!("{analog} takes no arguments");
                }
                println!("{:.3}", IonoPi::new()?.voltage_read(analog)?);
            } else {
                return Ok(false);
            }
        }
    }

    Ok(true)
}
