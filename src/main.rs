#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod board;

#[cfg(target_os = "none")]
use {defmt_rtt as _, panic_probe as _};

#[cfg(target_os = "none")]
pub const XTAL_FREQ_HZ: u32 = 12_000_000_u32;

#[cfg(all(target_os = "none", not(feature = "generic-bootloader")))]
#[used]
#[no_mangle]
#[link_section = ".boot2"]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;

#[cfg(all(target_os = "none", feature = "generic-bootloader"))]
#[used]
#[no_mangle]
#[link_section = ".boot2"]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GENERIC_03H;

#[cfg(target_os = "none")]
rtic_monotonics::rp2040_timer_monotonic!(Mono);

#[cfg(target_os = "none")]
#[rtic::app(device = rp2040_hal::pac, peripherals = true, dispatchers = [SW0_IRQ, SW1_IRQ])]
mod app {
    use super::*;

    use crate::board::*;
    use cortex_m::singleton;
    use embedded_hal::digital::StatefulOutputPin;
    use mula::config::SAMPLE_MEMORY;
    use mula::link::{self, Command, CommandParser, Drain};
    use mula::{CaptureError, CaptureRequest, CapturedResult, Domain, MemoryRegion};
    use portable_atomic::{AtomicBool, AtomicU8, Ordering};
    use rp2040_hal::{self as hal, gpio::*, pac, usb::UsbBus};
    use rtic_monotonics::rp2040::prelude::*;
    use usb_device::{class_prelude::*, prelude::*};
    use usbd_serial::SerialPort;

    /// Set by the ready callback, cleared by the USB task.
    static SAMPLES_READY: AtomicBool = AtomicBool::new(false);
    /// Code of the pending failure, `NO_FAILURE` otherwise.
    static FAILURE: AtomicU8 = AtomicU8::new(NO_FAILURE);
    const NO_FAILURE: u8 = u8::MAX;

    fn samples_ready(_result: CapturedResult) {
        SAMPLES_READY.store(true, Ordering::Release);
        rtic::pend(pac::Interrupt::USBCTRL_IRQ);
    }

    fn sampling_failed(error: CaptureError) {
        FAILURE.store(error as u8, Ordering::Release);
        rtic::pend(pac::Interrupt::USBCTRL_IRQ);
    }

    /// Bytes queued for the host that the serial class has not taken yet.
    struct Outbox {
        bytes: [u8; link::HEADER_LEN],
        len: usize,
        sent: usize,
    }

    impl Outbox {
        const fn empty() -> Self {
            Self {
                bytes: [0; link::HEADER_LEN],
                len: 0,
                sent: 0,
            }
        }

        fn put(&mut self, bytes: &[u8]) {
            let len = bytes.len().min(self.bytes.len());
            self.bytes[..len].copy_from_slice(&bytes[..len]);
            self.len = len;
            self.sent = 0;
        }

        /// Returns `true` once everything has been written.
        fn flush(&mut self, serial: &mut SerialPort<'static, UsbBus>) -> bool {
            while self.sent < self.len {
                match serial.write(&self.bytes[self.sent..self.len]) {
                    Ok(n) if n > 0 => self.sent += n,
                    _ => return false,
                }
            }
            true
        }
    }

    #[shared]
    struct Shared {
        coordinator: Coordinator,
    }

    #[local]
    struct Local {
        usb_dev: UsbDevice<'static, UsbBus>,
        serial: SerialPort<'static, UsbBus>,
        parser: CommandParser,
        request: CaptureRequest,
        outbox: Outbox,
        drain: Option<Drain>,
        status_led: Pin<DynPinId, FunctionSioOutput, PullDown>,
    }

    #[init(local = [memory: [u8; SAMPLE_MEMORY] = [0; SAMPLE_MEMORY]])]
    fn init(ctx: init::Context) -> (Shared, Local) {
        unsafe {
            hal::sio::spinlock_reset();
        }

        let mut resets = ctx.device.RESETS;
        let mut watchdog = hal::Watchdog::new(ctx.device.WATCHDOG);
        let clocks = hal::clocks::init_clocks_and_plls(
            XTAL_FREQ_HZ,
            ctx.device.XOSC,
            ctx.device.CLOCKS,
            ctx.device.PLL_SYS,
            ctx.device.PLL_USB,
            &mut resets,
            &mut watchdog,
        )
        .ok()
        .unwrap();

        // 1500 MHz VCO / 15 for SYSTEM_CLOCK_HZ
        unsafe {
            let pll = &*pac::PLL_SYS::ptr();
            pll.prim()
                .modify(|_, w| w.postdiv1().bits(5).postdiv2().bits(3));
        };

        Mono::start(ctx.device.TIMER, &resets);

        let usb_bus = UsbBus::new(
            ctx.device.USBCTRL_REGS,
            ctx.device.USBCTRL_DPRAM,
            clocks.usb_clock,
            true,
            &mut resets,
        );
        let usb_bus: &'static UsbBusAllocator<UsbBus> =
            singleton!(: UsbBusAllocator<UsbBus> = UsbBusAllocator::new(usb_bus)).unwrap();
        let serial = SerialPort::new(usb_bus);
        let usb_dev = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0x16c0, 0x27dd))
            .strings(&[StringDescriptors::default()
                .manufacturer("Ferris & Co")
                .product("mixed-signal mula")
                .serial_number("_mula_")])
            .unwrap()
            .device_class(2)
            .build();

        let (pio, sm0, _, _, _) = ctx.device.PIO0.split(&mut resets);
        let sio = hal::Sio::new(ctx.device.SIO);
        let pins = Pins::new(
            ctx.device.IO_BANK0,
            ctx.device.PADS_BANK0,
            sio.gpio_bank0,
            &mut resets,
        );

        let probes = [
            pins.gpio0.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio1.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio2.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio3.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio4.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio5.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio6.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio7.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio8.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio9.into_function::<FunctionPio0>().into_dyn_pin(),
            pins.gpio10.into_function::<FunctionPio0>().into_dyn_pin(),
        ];
        let gain = gain_bus(
            pins.gpio13.into_push_pull_output().into_dyn_pin(),
            pins.gpio14.into_push_pull_output().into_dyn_pin(),
            pins.gpio15.into_push_pull_output().into_dyn_pin(),
        );
        let status_led = pins.gpio25.into_push_pull_output().into_dyn_pin();

        let lanes = PioLanes::new(pio, sm0, probes);
        let adc = AdcRing::new(ctx.device.ADC, ctx.device.DMA, &mut resets);
        let memory = MemoryRegion::single(ctx.local.memory);
        let mut coordinator =
            Coordinator::new(lanes, adc, gain, SampleClock::default(), memory);
        coordinator.on_samples_ready(samples_ready);
        coordinator.on_sampling_failed(sampling_failed);

        heartbeat::spawn().ok();
        threshold_scan::spawn().ok();
        defmt::info!("mula ready");

        (
            Shared { coordinator },
            Local {
                usb_dev,
                serial,
                parser: CommandParser::new(),
                request: CaptureRequest::default(),
                outbox: Outbox::empty(),
                drain: None,
                status_led,
            },
        )
    }

    #[task(binds = PIO0_IRQ_0, priority = 3, shared = [coordinator])]
    fn exchange_tick(mut ctx: exchange_tick::Context) {
        ctx.shared.coordinator.lock(|coordinator| {
            while coordinator.digital_mut().front_end_mut().collect() {
                coordinator.on_exchange_tick();
            }
        });
    }

    #[task(binds = DMA_IRQ_0, priority = 3, shared = [coordinator])]
    fn ring_block(mut ctx: ring_block::Context) {
        ctx.shared.coordinator.lock(|coordinator| {
            let event = coordinator.analog_mut().front_end_mut().service();
            if event.fault {
                coordinator.on_transfer_error(Domain::Analog);
            } else if event.notify {
                coordinator.on_ring_wrap();
            }
        });
    }

    #[task(binds = IO_IRQ_BANK0, priority = 2, shared = [coordinator])]
    fn level_match(mut ctx: level_match::Context) {
        ctx.shared.coordinator.lock(|coordinator| {
            coordinator.digital_mut().front_end_mut().acknowledge_match();
            coordinator.on_level_match();
        });
    }

    #[task(priority = 2, shared = [coordinator])]
    async fn threshold_scan(mut ctx: threshold_scan::Context) {
        loop {
            ctx.shared.coordinator.lock(|coordinator| {
                while let Some(crossing) = coordinator.analog_mut().front_end_mut().next_crossing()
                {
                    coordinator.on_threshold_crossing(&crossing);
                }
            });
            Mono::delay(50.micros()).await;
        }
    }

    #[task(
        binds = USBCTRL_IRQ,
        priority = 1,
        shared = [coordinator],
        local = [usb_dev, serial, parser, request, outbox, drain],
    )]
    fn usb_irq(mut ctx: usb_irq::Context) {
        let usb_irq::LocalResources {
            usb_dev,
            serial,
            parser,
            request,
            outbox,
            drain,
            ..
        } = ctx.local;

        if usb_dev.poll(&mut [&mut *serial]) {
            if let Ok(n) = serial.read(parser.space()) {
                parser.commit(n);
            }
        }

        while let Some(command) = parser.next_command() {
            if command.apply(request) {
                if command == Command::Reset {
                    *drain = None;
                    ctx.shared.coordinator.lock(|c| c.disarm()).ok();
                }
                continue;
            }
            let outcome = ctx.shared.coordinator.lock(|c| match command {
                Command::Arm => {
                    *drain = None;
                    c.configure(request).and_then(|_| c.arm())
                }
                Command::Disarm => c.disarm(),
                Command::Calibrate { volts_per_div } => {
                    *drain = None;
                    c.configure_for_calibration(volts_per_div)
                }
                _ => Ok(()),
            });
            if command == Command::GetId {
                outbox.put(link::DEVICE_ID);
            }
            if let Err(error) = outcome {
                outbox.put(&[link::FAILURE_TAG, error as u8]);
            }
        }

        if !outbox.flush(serial) {
            return;
        }
        let failure = FAILURE.swap(NO_FAILURE, Ordering::AcqRel);
        if failure != NO_FAILURE {
            *drain = None;
            outbox.put(&[link::FAILURE_TAG, failure]);
            if !outbox.flush(serial) {
                return;
            }
        }
        if SAMPLES_READY.swap(false, Ordering::AcqRel) {
            if let Some(result) = ctx.shared.coordinator.lock(|c| c.take_result()) {
                outbox.put(&link::result_header(&result));
                *drain = Some(Drain::new(&result));
                if !outbox.flush(serial) {
                    return;
                }
            }
        }

        let Some(progress) = drain else {
            return;
        };
        let mut scratch = [0; 64];
        loop {
            let n = ctx.shared.coordinator.lock(|c| {
                progress.peek(c.digital_buffer(), c.analog_buffer(), &mut scratch)
            });
            if n == 0 {
                break;
            }
            match serial.write(&scratch[..n]) {
                Ok(written) if written > 0 => progress.consume(written),
                _ => break,
            }
        }
        if progress.is_done() {
            *drain = None;
        }
    }

    #[task(priority = 1, local = [status_led])]
    async fn heartbeat(ctx: heartbeat::Context) {
        loop {
            ctx.local.status_led.toggle().ok();
            Mono::delay(500.millis()).await;
        }
    }
}
