use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vsphere_influxdb::aggregate::{aggregate, average, summation};
use vsphere_influxdb::inventory::{EntityContext, Inventory};
use vsphere_influxdb::point::PointAssembler;
use vsphere_influxdb::sink::line_protocol::{encode, Precision};
use vsphere_influxdb::vsphere::{EntityMetric, ManagedObjectRef, RawSeries};

/// Fifteen 20s samples cover a 5 minute window.
fn samples() -> Vec<i64> {
    (0..15).map(|i| if i % 7 == 0 { -1 } else { i * 113 }).collect()
}

fn vm(i: usize) -> ManagedObjectRef {
    ManagedObjectRef::new("VirtualMachine", format!("vm-{i}"))
}

fn fixture(vms: usize) -> (Inventory, HashMap<i32, String>, Vec<EntityMetric>) {
    let counters = HashMap::from([
        (2, "cpu.usage.average".to_string()),
        (24, "mem.usage.average".to_string()),
        (125, "disk.usage.average".to_string()),
        (143, "net.usage.average".to_string()),
    ]);

    let mut inventory = Inventory::default();
    let mut results = Vec::with_capacity(vms);

    for i in 0..vms {
        let entity = vm(i);
        let name = format!("VM-{i:04}.corp.local");
        inventory.refs.push(entity.clone());
        inventory.names.insert(entity.clone(), name.clone());
        inventory.contexts.insert(
            entity.clone(),
            EntityContext {
                display_name: name,
                cluster: Some("prod".to_string()),
                host: Some(format!("esx{:02}.corp.local", i % 16)),
                datastore: Some("ds-gold".to_string()),
            },
        );

        let series = [(2, ""), (24, ""), (125, "scsi0:0"), (125, "scsi0:1"), (143, "vmnic0")]
            .iter()
            .map(|(counter_id, instance)| RawSeries {
                entity: entity.clone(),
                counter_id: *counter_id,
                instance: instance.to_string(),
                samples: samples(),
            })
            .collect();

        results.push(EntityMetric { entity, series });
    }

    (inventory, counters, results)
}

fn bench_reduce(c: &mut Criterion) {
    let data = samples();
    let series = RawSeries {
        entity: vm(0),
        counter_id: 125,
        instance: "scsi0:0".to_string(),
        samples: data.clone(),
    };

    c.bench_function("average_15_samples", |b| {
        b.iter(|| average(black_box(&data)));
    });

    c.bench_function("summation_15_samples", |b| {
        b.iter(|| summation(black_box(&data)));
    });

    c.bench_function("aggregate_instance_series", |b| {
        b.iter(|| aggregate(black_box("disk.usage.average"), black_box(&series)));
    });
}

fn bench_assemble(c: &mut Criterion) {
    let (inventory, counters, results) = fixture(500);
    let assembler = PointAssembler::new("vc01.corp.local", ".corp.local", &inventory, &counters);

    c.bench_function("assemble_500_vms", |b| {
        b.iter(|| assembler.assemble(black_box(&results)));
    });

    let (points, _) = assembler.assemble(&results);
    c.bench_function("encode_line_protocol_500_vms", |b| {
        b.iter(|| encode(black_box(&points), Precision::Seconds));
    });
}

criterion_group!(benches, bench_reduce, bench_assemble);
criterion_main!(benches);
