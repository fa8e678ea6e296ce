#![no_std]
#![no_main]

use defmt::{info, warn};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_rp::bind_interrupts;
use embassy_rp::flash::Flash;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::peripherals::USB;
use embassy_rp::usb::Driver;
use embassy_time::{Duration, Instant, Ticker};
use embassy_usb::class::hid::{HidReader, HidWriter, State};
use embassy_usb::{Builder, Config as UsbConfig, UsbDevice};
use static_cell::StaticCell;

use remapper_rp2040::usb::{CommandFrame, COMMANDS, MONITOR, OUTGOING};
use remapper_rp2040::{
    configure_usb, ButtonBank, ChannelTransport, Config, ConfigFlash, MonitorRequestHandler,
    Remapper, Stats, TickFlag, PERSISTED_CONFIG_SIZE, REPORT_DESCRIPTOR,
};

#[cfg(feature = "dev-panic")]
use panic_probe as _;
#[cfg(feature = "prod-panic")]
use panic_reset as _;

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => embassy_rp::usb::InterruptHandler<USB>;
});

/// Pending 1 ms tick, set by the tick task and drained at most once per
/// main-loop iteration.
static TICK: TickFlag = TickFlag::new();

/// USB device configuration buffers.
static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static MSOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
static CONTROL_BUF: StaticCell<[u8; 64]> = StaticCell::new();

/// HID interface state.
static MAIN_HID_STATE: StaticCell<State> = StaticCell::new();
static MONITOR_HID_STATE: StaticCell<State> = StaticCell::new();

/// Handler for SET_REPORT control transfers on the monitor interface
/// (feature reports carry the config commands).
static MONITOR_HANDLER: StaticCell<MonitorRequestHandler> = StaticCell::new();

/// USB serial number string (board unique id in hex).
static SERIAL: StaticCell<[u8; 16]> = StaticCell::new();

/// Flash image staging buffer (too large for the main task's stack).
static CONFIG_IMAGE: StaticCell<[u8; PERSISTED_CONFIG_SIZE]> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("HID remapper starting...");

    let p = embassy_rp::init(embassy_rp::config::Config::default());

    // --- Flash / config ---
    let mut flash = ConfigFlash::new(Flash::new_blocking(p.FLASH));
    let image = CONFIG_IMAGE.init([0; PERSISTED_CONFIG_SIZE]);
    flash.load(image);
    let config = Config::load(&image[..]);
    info!(
        "config loaded: {=usize} rules, monitor {}",
        config.rules.len(),
        config.monitor_enabled
    );

    let mut remapper =
        defmt::unwrap!(Remapper::new(REPORT_DESCRIPTOR, config), "own descriptor must parse");

    // --- USB setup ---
    let serial = SERIAL.init([0; 16]);
    hex_id(&flash.unique_id(), serial);
    let usb_driver = Driver::new(p.USB, Irqs);

    let mut usb_config = UsbConfig::new(0x1209, 0x0002); // pid.codes test VID/PID
    usb_config.manufacturer = Some("Rust Remapper");
    usb_config.product = Some("HID Input Remapper");
    usb_config.serial_number = core::str::from_utf8(serial).ok();
    usb_config.max_power = 100;
    usb_config.max_packet_size_0 = 64;

    let mut builder = Builder::new(
        usb_driver,
        usb_config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        MSOS_DESCRIPTOR.init([0; 256]),
        CONTROL_BUF.init([0; 64]),
    );

    let (main_writer, monitor) = configure_usb(
        &mut builder,
        MAIN_HID_STATE.init(State::new()),
        MONITOR_HID_STATE.init(State::new()),
        MONITOR_HANDLER.init(MonitorRequestHandler),
    );
    let (monitor_reader, monitor_writer) = monitor.split();
    let usb_device = builder.build();

    // --- GPIO ---
    let buttons = ButtonBank::new([
        Input::new(p.PIN_2, Pull::Up),
        Input::new(p.PIN_3, Pull::Up),
        Input::new(p.PIN_4, Pull::Up),
        Input::new(p.PIN_5, Pull::Up),
        Input::new(p.PIN_6, Pull::Up),
        Input::new(p.PIN_7, Pull::Up),
        Input::new(p.PIN_8, Pull::Up),
        Input::new(p.PIN_9, Pull::Up),
    ]);
    let mut led = Output::new(p.PIN_25, Level::Low);

    spawner.must_spawn(usb_task(usb_device));
    spawner.must_spawn(hid_writer_task(main_writer));
    spawner.must_spawn(monitor_writer_task(monitor_writer));
    spawner.must_spawn(monitor_reader_task(monitor_reader));
    spawner.must_spawn(tick_task());

    info!("HID remapper initialized");

    // --- Main cooperative loop ---
    let mut transport = ChannelTransport;
    let mut pacer = Ticker::every(Duration::from_micros(500));
    let mut last_stats = Instant::now();
    let mut prev_stats = Stats::default();
    let mut persist_failed = false;
    let mut led_off_at = Instant::now();
    let mut led_events = 0u32;

    loop {
        pacer.next().await;
        let now_us = Instant::now().as_micros();
        let tick_due = TICK.take();

        remapper.handle_gpio(buttons.sample(), now_us);
        remapper.poll(tick_due, now_us, &mut transport);

        while let Ok(frame) = COMMANDS.try_receive() {
            handle_command(&mut remapper, &frame);
        }

        let pending = remapper.take_pending();
        if pending.bootloader {
            info!("rebooting into ROM bootloader");
            embassy_rp::rom_data::reset_to_usb_boot(0, 0);
        }
        // A failed write is retried when the config next goes dirty, not
        // in a tight erase loop. The in-RAM config stays authoritative
        // either way.
        if pending.persist || (persist_failed && pending.config_dirty) {
            remapper.serialize_config(image);
            match flash.save(image) {
                Ok(()) => {
                    persist_failed = false;
                    info!("config persisted");
                }
                Err(e) => {
                    persist_failed = true;
                    warn!("config flash write failed: {}", e);
                }
            }
        }

        let now = Instant::now();
        let stats = remapper.stats();
        // Activity blink: the LED lights for 50 ms after each input event.
        if stats.events != led_events {
            led_events = stats.events;
            led.set_high();
            led_off_at = now + Duration::from_millis(50);
        }
        if now >= led_off_at {
            led.set_low();
        }
        if now - last_stats >= Duration::from_secs(1) {
            last_stats = now;
            print_stats(stats, &mut prev_stats);
        }
    }
}

fn handle_command(remapper: &mut Remapper, frame: &CommandFrame) {
    if let Err(e) = remapper.handle_command(frame.as_slice()) {
        warn!("config command rejected: {}", e);
    }
}

/// 1 Hz rate snapshot of the engine counters.
fn print_stats(stats: Stats, prev: &mut Stats) {
    info!(
        "stats: {=u32} events/s, {=u32} ticks/s, {=u32} dropped targets",
        stats.events.wrapping_sub(prev.events),
        stats.ticks.wrapping_sub(prev.ticks),
        stats.dropped_targets,
    );
    *prev = stats;
}

fn hex_id(id: &[u8; 8], out: &mut [u8; 16]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for (i, byte) in id.iter().enumerate() {
        out[2 * i] = HEX[(byte >> 4) as usize];
        out[2 * i + 1] = HEX[(byte & 0x0F) as usize];
    }
}

/// USB device task - runs the USB stack.
#[embassy_executor::task]
async fn usb_task(mut device: UsbDevice<'static, Driver<'static, USB>>) -> ! {
    device.run().await
}

/// Drains assembled reports into the composite HID endpoint.
#[embassy_executor::task]
async fn hid_writer_task(mut writer: HidWriter<'static, Driver<'static, USB>, 16>) -> ! {
    loop {
        let frame = OUTGOING.receive().await;
        if let Err(e) = writer.write(frame.as_slice()).await {
            warn!("report write failed: {:?}", e);
        }
    }
}

/// Drains monitor dumps into the monitor endpoint.
#[embassy_executor::task]
async fn monitor_writer_task(mut writer: HidWriter<'static, Driver<'static, USB>, 64>) -> ! {
    loop {
        let frame = MONITOR.receive().await;
        if let Err(e) = writer.write(frame.as_slice()).await {
            warn!("monitor write failed: {:?}", e);
        }
    }
}

/// Feeds monitor-interface output reports (injected downstream reports)
/// and feature reports (config commands) into their channels.
#[embassy_executor::task]
async fn monitor_reader_task(reader: HidReader<'static, Driver<'static, USB>, 64>) -> ! {
    let mut handler = MonitorRequestHandler;
    reader.run(false, &mut handler).await
}

/// The 1 kHz tick source. embassy-usb does not surface start-of-frame,
/// so the USB frame cadence is reproduced with the time driver; the
/// mapping engine only needs the 1 ms period, not frame alignment.
#[embassy_executor::task]
async fn tick_task() -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(1));
    loop {
        ticker.next().await;
        TICK.set();
    }
}
